pub mod bindless_manager;
pub mod clock;
pub mod descriptor;
pub mod epoch;
pub mod epoch_fences;
pub mod frame_counter;
pub mod phase_error;
pub mod reclaimer;
pub mod render_data;
pub mod state_tracker;
pub mod timer;
