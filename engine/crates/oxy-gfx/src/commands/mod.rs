pub mod barrier;
pub mod command;
pub mod command_list;
pub mod pool;
pub mod submit_info;
