pub mod core_passes;
pub mod render_context;
pub mod render_graph;
pub mod view_constants;
