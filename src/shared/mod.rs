pub mod naming;
pub mod process;
