pub mod config;
pub mod evaluate;
pub mod replay;
pub mod simulate;
