pub mod change_log;
pub mod meter;
pub mod reading;
pub mod timestamps;

pub use change_log::{ChangeLogEntry, ChangeOperation, ChangeTable};
pub use meter::{Meter, MeterChanges, MeterKind, UnknownMeterKind};
pub use reading::{derive_consumption, reading_key, DailyConsumption, NewReading, Reading, DEFAULT_READING_TIME};
