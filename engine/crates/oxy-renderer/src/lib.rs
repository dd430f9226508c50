pub mod frame_graph;
pub mod geometry_cache;
pub mod material_table;
pub mod render_world;
pub mod renderer;
