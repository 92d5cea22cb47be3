pub mod checkout;
pub mod core;
pub mod diff;
pub mod gc;
pub mod hash;
pub mod index;
pub mod lock;
