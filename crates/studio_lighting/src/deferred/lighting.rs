//! Lighting resolve math and view data.
//!
//! The full-screen resolve lives in `deferred_lighting.wgsl`. The functions
//! here are the same math on the CPU, kept in step with the shader so the
//! shading model can be checked without a GPU:
//!
//! ```text
//! attenuation = clamp(1 - (d / r)^4, 0, 1)^2 / max(d^2, 1e-4)
//! specular    = D_ggx * G_smith * F_schlick / (4 n.v n.l)
//! diffuse     = (1 - F) (1 - metallic) * albedo / PI
//! color       = gamma(reinhard(sum(lights) + ambient * albedo * ao))
//! ```

use std::f32::consts::PI;

use bevy::prelude::*;

use super::cluster::LightClusterer;
use super::config::{ClusterGridConfig, ShadowConfig};
use super::light::{AmbientTerm, PointLight};

pub const GAMMA: f32 = 2.2;

/// Camera data supplied once per frame before any pass runs.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameCamera {
    /// World to view.
    pub view: Mat4,
    /// View to clip.
    pub projection: Mat4,
    pub position: Vec3,
    /// Cluster depth range.
    pub near: f32,
    pub far: f32,
    /// Physical viewport inside the render target.
    pub viewport_origin: UVec2,
    pub viewport_size: UVec2,
}

impl FrameCamera {
    pub fn view_proj(&self) -> Mat4 {
        self.projection * self.view
    }
}

/// Lighting pass view block. Must match `LightingView` in deferred_lighting.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightingViewUniform {
    pub inv_view_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    /// width, height, near, far
    pub screen: [f32; 4],
    pub viewport_origin: [f32; 4],
    /// tiles_x, tiles_y, slices_z, max lights per cluster
    pub grid: [u32; 4],
    /// x = compare bias, y = cube face near plane
    pub shadow: [f32; 4],
}

impl LightingViewUniform {
    pub fn new(camera: &FrameCamera, grid: &ClusterGridConfig, shadow: &ShadowConfig) -> Self {
        Self {
            inv_view_proj: camera.view_proj().inverse().to_cols_array_2d(),
            view: camera.view.to_cols_array_2d(),
            screen: [
                camera.viewport_size.x as f32,
                camera.viewport_size.y as f32,
                camera.near,
                camera.far,
            ],
            viewport_origin: [
                camera.viewport_origin.x as f32,
                camera.viewport_origin.y as f32,
                0.0,
                0.0,
            ],
            grid: [
                grid.tiles_x,
                grid.tiles_y,
                grid.slices_z,
                grid.max_lights_per_cluster,
            ],
            shadow: [shadow.compare_bias, shadow.near_plane, 0.0, 0.0],
        }
    }
}

/// Smooth windowed inverse-square falloff, exactly 0 at `radius`.
pub fn attenuation(distance: f32, radius: f32) -> f32 {
    if radius <= 0.0 {
        return 0.0;
    }
    let ratio = distance / radius;
    let window = (1.0 - ratio.powi(4)).clamp(0.0, 1.0);
    window * window / (distance * distance).max(1e-4)
}

pub fn distribution_ggx(n_dot_h: f32, roughness: f32) -> f32 {
    let a = roughness * roughness;
    let a2 = a * a;
    let denom = n_dot_h * n_dot_h * (a2 - 1.0) + 1.0;
    a2 / (PI * denom * denom).max(1e-7)
}

fn geometry_schlick_ggx(n_dot_x: f32, k: f32) -> f32 {
    n_dot_x / (n_dot_x * (1.0 - k) + k)
}

pub fn geometry_smith(n_dot_v: f32, n_dot_l: f32, roughness: f32) -> f32 {
    let r = roughness + 1.0;
    let k = r * r / 8.0;
    geometry_schlick_ggx(n_dot_v, k) * geometry_schlick_ggx(n_dot_l, k)
}

pub fn fresnel_schlick(cos_theta: f32, f0: Vec3) -> Vec3 {
    f0 + (Vec3::ONE - f0) * (1.0 - cos_theta).clamp(0.0, 1.0).powi(5)
}

/// What the lighting pass reads back from the G-buffer for one pixel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SurfaceSample {
    pub position: Vec3,
    pub normal: Vec3,
    pub albedo: Vec3,
    pub roughness: f32,
    pub metallic: f32,
    pub ambient_occlusion: f32,
}

impl SurfaceSample {
    pub fn new(position: Vec3, normal: Vec3, albedo: Vec3) -> Self {
        Self {
            position,
            normal: normal.normalize_or_zero(),
            albedo,
            roughness: 0.5,
            metallic: 0.0,
            ambient_occlusion: 1.0,
        }
    }
}

/// Cook-Torrance radiance from one point light, before shadowing.
pub fn shade_point(surface: &SurfaceSample, light: &PointLight, camera_position: Vec3) -> Vec3 {
    let to_light = light.position - surface.position;
    let distance = to_light.length();
    let falloff = attenuation(distance, light.radius);
    if falloff <= 0.0 || distance <= 0.0 {
        return Vec3::ZERO;
    }

    let n = surface.normal;
    let l = to_light / distance;
    let v = (camera_position - surface.position).normalize_or_zero();
    let h = (l + v).normalize_or_zero();

    let n_dot_l = n.dot(l).max(0.0);
    if n_dot_l <= 0.0 {
        return Vec3::ZERO;
    }
    let n_dot_v = n.dot(v).max(1e-4);
    let roughness = surface.roughness.clamp(0.04, 1.0);

    let f0 = Vec3::splat(0.04).lerp(surface.albedo, surface.metallic);
    let fresnel = fresnel_schlick(h.dot(v).max(0.0), f0);
    let d = distribution_ggx(n.dot(h).max(0.0), roughness);
    let g = geometry_smith(n_dot_v, n_dot_l, roughness);
    let specular = fresnel * (d * g / (4.0 * n_dot_v * n_dot_l + 1e-4));

    let k_d = (Vec3::ONE - fresnel) * (1.0 - surface.metallic);
    let radiance = light.color * light.intensity * falloff;

    (k_d * surface.albedo / PI + specular) * radiance * n_dot_l
}

/// Manual cube shadow test: 1.0 when lit, 0.0 when occluded.
///
/// `stored_depth` is the normalized distance read from the cube map.
pub fn shadow_visibility(
    light_position: Vec3,
    surface_position: Vec3,
    far: f32,
    stored_depth: f32,
    compare_bias: f32,
) -> f32 {
    let current = (surface_position - light_position).length();
    if (current - compare_bias) / far <= stored_depth {
        1.0
    } else {
        0.0
    }
}

pub fn reinhard(color: Vec3) -> Vec3 {
    color / (color + Vec3::ONE)
}

pub fn gamma_encode(color: Vec3) -> Vec3 {
    color.max(Vec3::ZERO).powf(1.0 / GAMMA)
}

/// Tone map and, for linear targets, gamma-encode.
pub fn resolve_color(hdr: Vec3, manual_gamma: bool) -> Vec3 {
    let mapped = reinhard(hdr.max(Vec3::ZERO));
    if manual_gamma {
        gamma_encode(mapped)
    } else {
        mapped
    }
}

/// Rec. 709 luma.
pub fn luminance(color: Vec3) -> f32 {
    color.dot(Vec3::new(0.2126, 0.7152, 0.0722))
}

/// CPU model of the full-screen resolve.
#[derive(Clone, Copy, Debug)]
pub struct LightingResolver {
    /// Apply gamma in the resolve instead of relying on an sRGB target.
    pub manual_gamma: bool,
}

impl Default for LightingResolver {
    fn default() -> Self {
        Self { manual_gamma: true }
    }
}

impl LightingResolver {
    /// Linear HDR color from the given lights plus ambient.
    pub fn radiance<'a>(
        &self,
        surface: &SurfaceSample,
        lights: impl IntoIterator<Item = &'a PointLight>,
        ambient: AmbientTerm,
        camera_position: Vec3,
    ) -> Vec3 {
        let direct: Vec3 = lights
            .into_iter()
            .map(|light| shade_point(surface, light, camera_position))
            .sum();
        direct + ambient.radiance() * surface.albedo * surface.ambient_occlusion
    }

    /// Final display color evaluating every light.
    pub fn shade<'a>(
        &self,
        surface: &SurfaceSample,
        lights: impl IntoIterator<Item = &'a PointLight>,
        ambient: AmbientTerm,
        camera_position: Vec3,
    ) -> Vec3 {
        resolve_color(
            self.radiance(surface, lights, ambient, camera_position),
            self.manual_gamma,
        )
    }

    /// Final display color evaluating only the lights of the surface's cluster,
    /// as the shader does.
    pub fn shade_clustered(
        &self,
        clusterer: &LightClusterer,
        lights: &[PointLight],
        ambient: AmbientTerm,
        surface: &SurfaceSample,
        camera: &FrameCamera,
    ) -> Vec3 {
        let clip = camera.view_proj() * surface.position.extend(1.0);
        let view_depth = -camera.view.transform_point3(surface.position).z;

        let cluster_lights = if clip.w > 0.0 {
            let ndc = clip.truncate().truncate() / clip.w;
            clusterer
                .cluster_for(ndc, view_depth)
                .map(|cell| clusterer.lights_in_cluster(cell))
                .unwrap_or(&[])
        } else {
            &[]
        };

        self.shade(
            surface,
            cluster_lights.iter().filter_map(|&i| lights.get(i as usize)),
            ambient,
            camera.position,
        )
    }
}
