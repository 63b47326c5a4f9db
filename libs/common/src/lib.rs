pub mod access;
pub mod snowflake;
pub mod uid;

pub use access::AccessMode;
pub use snowflake::UidGenerator;
pub use uid::{Uid, ZERO_UID};
