use slotmap::new_key_type;

new_key_type! { pub struct NodeHandle; }
new_key_type! { pub struct GeometryHandle; }
new_key_type! { pub struct MaterialHandle; }
