//! Weak-reference-guarded access to the owning device record.
//!
//! Download workers never keep their [`System`] alive on their own. Each
//! worker operation borrows the record through [`with_device`], which
//! upgrades the weak handle for the duration of a single call. When the
//! system has already been dropped the operation yields its result type's
//! default value and performs no side effects.

use std::sync::{Arc, Weak};

use crate::system::System;

pub(crate) fn with_device<R, F>(device: &Weak<System>, f: F) -> R
where
    R: Default,
    F: FnOnce(&Arc<System>) -> R,
{
    match device.upgrade() {
        Some(system) => f(&system),
        None => R::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropped_device_yields_default() {
        let weak: Weak<System> = Weak::new();
        let result: i32 = with_device(&weak, |_| 42);
        assert_eq!(result, 0);
        let result: bool = with_device(&weak, |_| true);
        assert!(!result);
    }
}
