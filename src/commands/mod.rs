pub mod deploy;
pub mod doctor;
pub mod snapshots;
pub mod verify;
