mod activity_id;
mod device_id;
mod run_id;
mod value;

pub use activity_id::ActivityId;
pub use device_id::DeviceId;
pub use run_id::RunId;
pub use value::Value;
