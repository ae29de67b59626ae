//! The modem subsystem: character-device access, the AT dialogue engine,
//! and the line arbiter.

mod arbiter;
mod device;
mod driver;

pub use arbiter::{Arbiter, ArbiterError, DeviceLock, DevicePool};
pub use device::{CharDevice, DeviceReader};
pub use driver::{
    clean_response, DeviceOpener, DialResponse, DialResult, DriverState, Modem, ModemError,
    ModemLink, ModemOpener, RawIo, SharedWriter,
};
