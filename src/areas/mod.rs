pub mod odb;
pub mod remote;
pub mod repository;
pub mod state;
pub mod workspace;
