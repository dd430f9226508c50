pub mod components {
    pub mod geometry;
    pub mod material;
    pub mod transform;
}

pub mod frustum;
pub mod guid_new_type;
pub mod scene;
pub mod scene_prep;
