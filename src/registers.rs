//! Register addresses and field codes for the synthesiser and controller
//! functional groups. Only the registers the SDK itself touches are listed;
//! application code addresses anything else through the raw report API.

// Synthesiser registers
pub const SYNTH_REG_IO_SIGNAL_CONTROL: u16 = 1;
pub const SYNTH_REG_SINGLE_TONE_PHASE: u16 = 2;
pub const SYNTH_REG_SINGLE_TONE_AMPL: u16 = 3;
pub const SYNTH_REG_SINGLE_TONE_FREQ: u16 = 4;
pub const SYNTH_REG_NHF_TIMEOUT: u16 = 18;
pub const SYNTH_REG_CLEAR_NHF: u16 = 19;
pub const SYNTH_REG_PROG_LOCAL: u16 = 25;
pub const SYNTH_REG_USE_LOCAL: u16 = 26;
pub const SYNTH_REG_PROG_SYNC_DIG: u16 = 32;
pub const SYNTH_REG_PROG_FREQ0_L: u16 = 58;
pub const SYNTH_REG_CHAN_SCOPE: u16 = 69;
pub const SYNTH_REG_SYNC_UPDATE: u16 = 70;
pub const SYNTH_REG_IMAGE_FORMAT: u16 = 72;
pub const SYNTH_REG_USE_LOCAL_INDEX: u16 = 78;

// Channel-scope register bits
pub const SYNTH_CHAN_SCOPE_SUPPORTED: u16 = 0x0001;

// Controller registers
pub const CTRLR_REG_NUM_PTS: u16 = 48;
pub const CTRLR_REG_OSC_FREQ: u16 = 49;
pub const CTRLR_REG_IMG_DELAY: u16 = 50;
pub const CTRLR_REG_IMG_MODES: u16 = 51;
pub const CTRLR_REG_EXT_POLARITY: u16 = 52;
pub const CTRLR_REG_IMG_PLAY: u16 = 53;
pub const CTRLR_REG_IMG_CTRL: u16 = 54;
pub const CTRLR_REG_IMG_PROGRESS: u16 = 55;
pub const CTRLR_REG_UUID: u16 = 56;
pub const CTRLR_REG_NUM_PTS_LO: u16 = 64;
pub const CTRLR_REG_NUM_PTS_HI: u16 = 65;
pub const CTRLR_REG_IMG_MODES_EXT: u16 = 70;
pub const CTRLR_REG_FPI_FORMAT: u16 = 74;

// Image play commands
pub const CTRLR_IMG_PLAY_FSTOP: u16 = 1;
pub const CTRLR_IMG_PLAY_STOP: u16 = 2;
pub const CTRLR_IMG_PLAY_RUN: u16 = 4;
pub const CTRLR_IMG_PLAY_ERUN: u16 = 8;

// Image control register bits
pub const CTRLR_IMG_CTRL_IOS_BUSY: u16 = 0x0001;
pub const CTRLR_IMG_CTRL_DL_ACTIVE: u16 = 0x0002;
pub const CTRLR_IMG_CTRL_COMMON_CHANNELS: u16 = 0x0004;
pub const CTRLR_IMG_CTRL_PRESCALER_DISABLE: u16 = 0x0008;

// FPI format register bits
pub const CTRLR_FPI_FORMAT_MSB_CAPABLE: u16 = 0x0001;

// Sequence DMA commands
pub const CTRLR_SYNDMA_START_DMA: u16 = 0;
pub const CTRLR_SYNDMA_DMA_ABORT: u16 = 2;

// Sequence playback commands
pub const CTRLR_SEQPLAY_SEQ_START: u16 = 0;
pub const CTRLR_SEQPLAY_USR_TRIG: u16 = 1;
pub const CTRLR_SEQPLAY_SEQ_STOP: u16 = 2;
pub const CTRLR_SEQPLAY_SEQ_PAUSE: u16 = 3;
pub const CTRLR_SEQPLAY_SEQ_RESTART: u16 = 4;

// Controller interrupt type codes
pub const CTRLR_INTERRUPT_SINGLE_IMAGE_FINISHED: u16 = 0;
pub const CTRLR_INTERRUPT_SEQUENCE_START: u16 = 1;
pub const CTRLR_INTERRUPT_SEQUENCE_FINISHED: u16 = 2;
pub const CTRLR_INTERRUPT_SEQUENCE_ERROR: u16 = 3;
pub const CTRLR_INTERRUPT_TONE_START: u16 = 5;
pub const CTRLR_INTERRUPT_SEQDL_ERROR: u16 = 6;
pub const CTRLR_INTERRUPT_SEQDL_COMPLETE: u16 = 7;
pub const CTRLR_INTERRUPT_SEQDL_BUFFER_PROCESSED: u16 = 8;
