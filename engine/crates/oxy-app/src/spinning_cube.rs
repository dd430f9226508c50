use std::sync::Arc;

use futures::future::LocalBoxFuture;
use glam::{Quat, Vec3, Vec4};

use oxy_asset::asset_loader::{AssetSource, encode_texture_blob};
use oxy_asset::handle::AssetKind;
use oxy_engine::frame_context::FrameContext;
use oxy_engine::module::EngineModule;
use oxy_engine::phase::{PhaseId, PhaseMask};
use oxy_gfx::resources::TextureFormat;
use oxy_render_interface::phase_error::{ErrorClass, PhaseError};
use oxy_render_interface::render_data::{RenderView, ViewDesc, Viewport};
use oxy_renderer::geometry_cache::GeometryData;
use oxy_renderer::render_world::RenderWorld;
use oxy_scene::components::geometry::{BoundingSphere, GeometryAsset};
use oxy_scene::components::material::MaterialAsset;
use oxy_scene::components::transform::Transform;
use oxy_scene::guid_new_type::NodeHandle;
use oxy_scene::scene::Renderable;

const CHECKER_LABEL: &str = "checker.tex";
const CHECKER_SIZE: u32 = 8;

/// 立方体的 24 个顶点（每个面 4 个）和 36 个索引
fn cube_mesh() -> GeometryData {
    let faces = [Vec3::X, Vec3::NEG_X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z];

    let mut vertices: Vec<[f32; 3]> = Vec::with_capacity(24);
    let mut indices: Vec<u32> = Vec::with_capacity(36);
    for normal in faces {
        let tangent = if normal.y.abs() > 0.5 { Vec3::X } else { Vec3::Y };
        let bitangent = normal.cross(tangent);
        let base = vertices.len() as u32;
        for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            vertices.push((normal + tangent * u + bitangent * v).to_array());
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    GeometryData::from_vertices(&vertices, &indices)
}

fn checker_texture() -> Vec<u8> {
    let pixels: Vec<u8> = (0..CHECKER_SIZE * CHECKER_SIZE)
        .flat_map(|i| {
            let (x, y) = (i % CHECKER_SIZE, i / CHECKER_SIZE);
            if (x + y) % 2 == 0 { [230, 230, 230, 255] } else { [40, 40, 40, 255] }
        })
        .collect();
    encode_texture_blob(CHECKER_SIZE, CHECKER_SIZE, TextureFormat::Rgba8Unorm, &pixels)
}

/// 在 Gameplay 阶段旋转立方体
pub struct SpinningCube {
    /// 弧度每秒
    speed: f32,
    angle: f32,
    node: Option<NodeHandle>,
}

impl SpinningCube {
    pub fn new(speed: f32) -> Self {
        Self {
            speed,
            angle: 0.0,
            node: None,
        }
    }
}

impl EngineModule for SpinningCube {
    fn name(&self) -> &str {
        "spinning-cube"
    }

    fn phases(&self) -> PhaseMask {
        PhaseMask::GAMEPLAY
    }

    fn on_attach(&mut self, ctx: &mut FrameContext) -> Result<(), PhaseError> {
        let Some(world) = ctx.resource_mut::<RenderWorld>() else {
            return Err(PhaseError::with_class(
                ErrorClass::FatalToEngine,
                "spinning-cube needs RenderWorld, attach the renderer first",
            ));
        };

        let geometry = world
            .scene
            .add_geometry(GeometryAsset::single("cube", BoundingSphere::new(Vec3::ZERO, 3f32.sqrt()), 36));
        let mut material = MaterialAsset::new("checker");
        material.base_color = Vec4::new(0.9, 0.6, 0.3, 1.0);
        material.base_color_map = CHECKER_LABEL.to_string();
        let material = world.scene.add_material(material);

        let node = world
            .scene
            .create_node("cube", None)
            .map_err(|err| PhaseError::with_class(ErrorClass::FatalToEngine, err.to_string()))?;
        world
            .scene
            .set_renderable(
                node,
                Some(Renderable {
                    geometry,
                    materials: vec![material],
                }),
            )
            .map_err(|err| PhaseError::with_class(ErrorClass::FatalToEngine, err.to_string()))?;

        world.stage_geometry(geometry, cube_mesh());
        world.request_load(CHECKER_LABEL, AssetKind::Texture, AssetSource::Bytes(Arc::from(checker_texture())));

        let camera = ViewDesc::look_at("main", Vec3::new(3.0, 2.0, 5.0), Vec3::ZERO, 1.0, 16.0 / 9.0, 0.1, 100.0);
        world.views.push(RenderView::new(camera, Viewport::new(1280.0, 720.0)));

        self.node = Some(node);
        log::info!("spinning cube ready");
        Ok(())
    }

    fn on_phase<'a>(&'a mut self, _phase: PhaseId, ctx: &'a mut FrameContext) -> LocalBoxFuture<'a, Result<(), PhaseError>> {
        Box::pin(async move {
            let Some(node) = self.node else {
                return Ok(());
            };
            self.angle = (self.angle + self.speed * ctx.delta_s()) % std::f32::consts::TAU;

            let Some(world) = ctx.resource_mut::<RenderWorld>() else {
                return Ok(());
            };
            let transform = Transform::IDENTITY.with_rotation(Quat::from_rotation_y(self.angle));
            world
                .scene
                .set_local_transform(node, transform)
                .map_err(|err| PhaseError::with_class(ErrorClass::FatalPerFrame, err.to_string()))
        })
    }
}
