pub mod hosts;
pub mod jobs;
pub mod restore;
