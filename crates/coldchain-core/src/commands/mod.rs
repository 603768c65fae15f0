pub mod backup;
pub mod status;
pub mod sync;
pub mod util;
