pub mod grants;
pub mod inventory;

pub use inventory::{CreatedDatabase, HostRegistration, Inventory, RecoveryPoint};
