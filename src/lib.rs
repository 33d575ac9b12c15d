pub mod bus;
pub mod cpu;
pub mod machine;
pub mod rom;
pub mod serial;
pub mod shell;
