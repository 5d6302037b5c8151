/*!
Host-side SDK core for iMS RF synthesiser/controller instruments.

The crate drives a family of instruments over USB serial and Ethernet
transports. Its centre is the per-connection engine: a set of cooperating
threads that serialise framed command reports to the device, parse the
streamed response protocol, match responses to outstanding requests, run
the auxiliary bulk file channel and fan out asynchronous interrupts.
Payload subsystems (image, compensation table, tone buffer, sequence and
firmware downloads) sit on top of those primitives.

# Example
```no_run
use ims_sdk::{ConnectionList, Report, Action, Dir};

let connections = ConnectionList::new();
let systems = connections.scan();
if let Some(system) = systems.first() {
    let conn = system.connection();
    conn.connect(system.conn_port());

    // read a synthesiser register
    let resp = conn.send_msg_blocking(Report::host(Action::SynthReg, Dir::Read, 0));
    if resp.done() && !resp.general_error() {
        println!("register 0 = {:#06x}", resp.payload::<u16>());
    }

    conn.disconnect();
}
```

Event handlers run synchronously on the engine thread that raised them:
keep them short, and never call back into blocking operations on the same
connection from inside a handler.
*/

mod connection_list;
pub mod download;
mod engine;
mod error;
mod event;
mod message;
pub mod registers;
pub mod report;
mod scope;
mod settings;
mod system;
pub mod transport;
mod util;
mod verify;

pub use connection_list::ConnectionList;
pub use engine::{Engine, FastTransferStatus};
pub use error::{Error, Result};
pub use event::{EventBus, MessageEvent, Subscription};
pub use message::{Message, MessageHandle, MessageStatus, NULL_MESSAGE};
pub use report::{
    Action, DeviceReport, Dir, ImageIndexOp, PayloadCodec, Report, ReportKind,
    FRAME_MAX_LENGTH, OVERHEAD_MAX_LENGTH, PAYLOAD_MAX_LENGTH,
};
pub use settings::{init_logging, settings_dir, settings_path, ConnectionConfig};
pub use system::{Capabilities, Controller, ImageTableEntry, Synthesiser, System};
pub use transport::{ConnectionManager, Timeouts};
pub use util::{str_to_uuid, uuid_to_str};
pub use verify::{BulkVerifier, VerifyChunk, VerifyEvent};
