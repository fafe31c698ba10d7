//! Clustered light assignment.
//!
//! The view frustum is split into a `tiles_x * tiles_y` screen grid and
//! `slices_z` exponential depth slices. Every frame each cell gets the list of
//! lights whose sphere of influence touches the cell's view-space AABB. The
//! lighting shader then only evaluates the lights of the cell a pixel falls in.
//!
//! Output is two flat tables, uploaded as-is:
//! - `clusters[cell] = { offset, count }`
//! - `light_indices[offset..offset + count]` = dense light indices
//!
//! Cells are visited z (outer), y, x (inner) and offsets are handed out from a
//! running total, so the regions are contiguous, disjoint, and start at 0.

use bevy::prelude::*;

use super::config::ClusterGridConfig;
use super::error::{DeferredError, DeferredResult};
use super::light::PointLight;

/// Per-cell entry in the cluster table. Must match `LightCluster` in deferred_lighting.wgsl.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct LightCluster {
    pub offset: u32,
    pub count: u32,
}

/// View-space depth range `[z_near, z_far)` of slice `slice`.
pub fn slice_depth_bounds(slice: u32, near: f32, far: f32, slices: u32) -> (f32, f32) {
    let ratio = far / near;
    let z_near = near * ratio.powf(slice as f32 / slices as f32);
    let z_far = near * ratio.powf((slice + 1) as f32 / slices as f32);
    (z_near, z_far)
}

/// Slice containing a positive view-space depth. Inverse of [`slice_depth_bounds`].
pub fn depth_slice(view_depth: f32, near: f32, far: f32, slices: u32) -> u32 {
    if view_depth <= near {
        return 0;
    }
    let t = (view_depth / near).ln() / (far / near).ln();
    ((t * slices as f32).floor().max(0.0) as u32).min(slices - 1)
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct CellCacheKey {
    proj_x: f32,
    proj_y: f32,
    near: f32,
    far: f32,
    grid: ClusterGridConfig,
}

/// CPU light clusterer. Reuses all of its buffers between updates.
#[derive(Debug)]
pub struct LightClusterer {
    grid: ClusterGridConfig,
    near: f32,
    far: f32,
    clusters: Vec<LightCluster>,
    light_indices: Vec<u32>,
    cell_bounds: Vec<(Vec3, Vec3)>,
    cell_key: Option<CellCacheKey>,
    view_lights: Vec<(Vec3, f32)>,
    saturated_cells: usize,
}

impl Default for LightClusterer {
    fn default() -> Self {
        Self::new(ClusterGridConfig::default())
    }
}

impl LightClusterer {
    pub fn new(grid: ClusterGridConfig) -> Self {
        Self {
            grid,
            near: 0.0,
            far: 0.0,
            clusters: vec![LightCluster::default(); grid.cell_count()],
            light_indices: Vec::with_capacity(grid.index_capacity()),
            cell_bounds: Vec::with_capacity(grid.cell_count()),
            cell_key: None,
            view_lights: Vec::new(),
            saturated_cells: 0,
        }
    }

    pub fn grid(&self) -> ClusterGridConfig {
        self.grid
    }

    /// Rebuild the cluster and index tables for this frame.
    ///
    /// `lights` must be in dense order; the indices written refer to it. On an
    /// invalid clip range the tables are emptied and an error is returned.
    pub fn update_clusters(
        &mut self,
        lights: &[PointLight],
        view: Mat4,
        projection: Mat4,
        near: f32,
        far: f32,
    ) -> DeferredResult<()> {
        self.light_indices.clear();
        self.clusters.fill(LightCluster::default());
        self.saturated_cells = 0;

        if !(near > 0.0) || !(far > near) {
            // Cell bounds belong to the old range; drop them with the tables
            self.cell_key = None;
            self.cell_bounds.clear();
            return Err(DeferredError::InvalidClipRange { near, far });
        }
        self.near = near;
        self.far = far;
        self.refresh_cell_bounds(projection, near, far);

        self.view_lights.clear();
        self.view_lights.extend(
            lights
                .iter()
                .map(|light| (view.transform_point3(light.position), light.radius)),
        );

        let max_per_cell = self.grid.max_lights_per_cluster;
        let mut total_indices = 0u32;

        // cell_bounds is laid out in cluster-index order, which is z, y, x iteration order
        for (cell, &(min, max)) in self.cell_bounds.iter().enumerate() {
            let offset = total_indices;
            let mut count = 0u32;

            for (light_index, &(center, radius)) in self.view_lights.iter().enumerate() {
                let closest = center.clamp(min, max);
                if center.distance_squared(closest) <= radius * radius {
                    if count == max_per_cell {
                        self.saturated_cells += 1;
                        break;
                    }
                    self.light_indices.push(light_index as u32);
                    count += 1;
                }
            }

            self.clusters[cell] = LightCluster { offset, count };
            total_indices += count;
        }

        Ok(())
    }

    fn refresh_cell_bounds(&mut self, projection: Mat4, near: f32, far: f32) {
        let key = CellCacheKey {
            proj_x: projection.x_axis.x,
            proj_y: projection.y_axis.y,
            near,
            far,
            grid: self.grid,
        };
        if self.cell_key == Some(key) {
            return;
        }

        // projection[1][1] may be negative under a flipped-Y convention
        let tan_half_fov = 1.0 / key.proj_y.abs();
        let aspect = (key.proj_y / key.proj_x).abs();
        let ClusterGridConfig {
            tiles_x,
            tiles_y,
            slices_z,
            ..
        } = self.grid;

        self.cell_bounds.clear();
        for z in 0..slices_z {
            let (z_near, z_far) = slice_depth_bounds(z, near, far, slices_z);
            for y in 0..tiles_y {
                let ndc_y_min = (y as f32 / tiles_y as f32) * 2.0 - 1.0;
                let ndc_y_max = ((y + 1) as f32 / tiles_y as f32) * 2.0 - 1.0;
                for x in 0..tiles_x {
                    let ndc_x_min = (x as f32 / tiles_x as f32) * 2.0 - 1.0;
                    let ndc_x_max = ((x + 1) as f32 / tiles_x as f32) * 2.0 - 1.0;

                    let mut min = Vec3::splat(f32::INFINITY);
                    let mut max = Vec3::splat(f32::NEG_INFINITY);
                    for depth in [z_near, z_far] {
                        for ndc_x in [ndc_x_min, ndc_x_max] {
                            for ndc_y in [ndc_y_min, ndc_y_max] {
                                let corner = Vec3::new(
                                    ndc_x * depth * tan_half_fov * aspect,
                                    ndc_y * depth * tan_half_fov,
                                    -depth,
                                );
                                min = min.min(corner);
                                max = max.max(corner);
                            }
                        }
                    }
                    self.cell_bounds.push((min, max));
                }
            }
        }
        self.cell_key = Some(key);
    }

    pub fn clusters(&self) -> &[LightCluster] {
        &self.clusters
    }

    pub fn light_indices(&self) -> &[u32] {
        &self.light_indices
    }

    pub fn total_indices(&self) -> usize {
        self.light_indices.len()
    }

    /// Cells that hit the per-cell cap during the last update.
    pub fn saturated_cells(&self) -> usize {
        self.saturated_cells
    }

    pub fn lights_in_cluster(&self, cell: usize) -> &[u32] {
        match self.clusters.get(cell) {
            Some(cluster) => {
                let start = cluster.offset as usize;
                &self.light_indices[start..start + cluster.count as usize]
            }
            None => &[],
        }
    }

    /// View-space bounds of a cell from the last successful update.
    pub fn cell_aabb(&self, cell: usize) -> Option<(Vec3, Vec3)> {
        self.cell_key?;
        self.cell_bounds.get(cell).copied()
    }

    /// Cell index for a pixel, the same lookup the lighting shader performs.
    ///
    /// `ndc` is in [-1, 1] with +Y up; `view_depth` is the positive distance
    /// along the view direction.
    pub fn cluster_for(&self, ndc: Vec2, view_depth: f32) -> Option<usize> {
        self.cell_key?;
        let grid = self.grid;
        let tile = |value: f32, tiles: u32| -> u32 {
            (((value * 0.5 + 0.5) * tiles as f32).floor().max(0.0) as u32).min(tiles - 1)
        };
        let x = tile(ndc.x, grid.tiles_x);
        let y = tile(ndc.y, grid.tiles_y);
        let z = depth_slice(view_depth, self.near, self.far, grid.slices_z);
        Some((x + y * grid.tiles_x + z * grid.tiles_x * grid.tiles_y) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEAR: f32 = 0.1;
    const FAR: f32 = 100.0;

    fn camera() -> (Mat4, Mat4) {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO, Vec3::Y);
        let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, NEAR, FAR);
        (view, projection)
    }

    fn scattered_lights(count: usize) -> Vec<PointLight> {
        (0..count)
            .map(|i| {
                let angle = i as f32 * 0.7;
                let ring = 2.0 + (i % 7) as f32;
                PointLight::new(
                    Vec3::new(angle.cos() * ring, (i % 3) as f32, angle.sin() * ring),
                    Vec3::ONE,
                    1.0,
                    3.0 + (i % 5) as f32,
                )
            })
            .collect()
    }

    #[test]
    fn test_regions_are_contiguous_and_disjoint() {
        let (view, projection) = camera();
        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&scattered_lights(64), view, projection, NEAR, FAR)
            .unwrap();

        let mut expected_offset = 0;
        for cluster in clusterer.clusters() {
            assert_eq!(cluster.offset, expected_offset);
            expected_offset += cluster.count;
        }
        assert_eq!(expected_offset as usize, clusterer.total_indices());
        assert!(clusterer.total_indices() > 0);
    }

    #[test]
    fn test_cell_capacity_first_lights_win() {
        let view = Mat4::IDENTITY;
        let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, NEAR, FAR);
        let lights: Vec<_> = (0..40)
            .map(|_| PointLight::new(Vec3::ZERO, Vec3::ONE, 1.0, 500.0))
            .collect();

        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&lights, view, projection, NEAR, FAR)
            .unwrap();

        let grid = ClusterGridConfig::default();
        assert!(clusterer.clusters().iter().all(|c| c.count <= 32));
        assert!(clusterer.total_indices() <= grid.index_capacity());
        assert_eq!(clusterer.saturated_cells(), grid.cell_count());
        assert_eq!(clusterer.lights_in_cluster(0), (0..32).collect::<Vec<u32>>().as_slice());
    }

    #[test]
    fn test_light_at_camera_reaches_every_cell() {
        let (view, projection) = camera();
        let eye = view.inverse().transform_point3(Vec3::ZERO);
        let light = PointLight::new(eye, Vec3::ONE, 1.0, FAR * 2.0);

        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&[light], view, projection, NEAR, FAR)
            .unwrap();

        assert!(clusterer.clusters().iter().all(|c| c.count == 1));
        assert_eq!(clusterer.total_indices(), 3456);
    }

    #[test]
    fn test_light_behind_camera_reaches_no_cell() {
        let view = Mat4::IDENTITY;
        let projection = Mat4::perspective_rh(60f32.to_radians(), 16.0 / 9.0, NEAR, FAR);
        let light = PointLight::new(Vec3::new(0.0, 0.0, 50.0), Vec3::ONE, 1.0, 1.0);

        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&[light], view, projection, NEAR, FAR)
            .unwrap();
        assert_eq!(clusterer.total_indices(), 0);
        assert!(clusterer.clusters().iter().all(|c| c.count == 0));
    }

    #[test]
    fn test_identical_inputs_identical_tables() {
        let (view, projection) = camera();
        let lights = scattered_lights(100);
        let mut clusterer = LightClusterer::default();

        clusterer
            .update_clusters(&lights, view, projection, NEAR, FAR)
            .unwrap();
        let clusters: Vec<u8> = bytemuck::cast_slice(clusterer.clusters()).to_vec();
        let indices: Vec<u8> = bytemuck::cast_slice(clusterer.light_indices()).to_vec();

        clusterer
            .update_clusters(&lights, view, projection, NEAR, FAR)
            .unwrap();
        assert_eq!(bytemuck::cast_slice::<_, u8>(clusterer.clusters()), clusters.as_slice());
        assert_eq!(bytemuck::cast_slice::<_, u8>(clusterer.light_indices()), indices.as_slice());
    }

    #[test]
    fn test_slice_bounds_and_lookup_agree() {
        let slices = 24;
        let (first_near, _) = slice_depth_bounds(0, NEAR, FAR, slices);
        let (_, last_far) = slice_depth_bounds(slices - 1, NEAR, FAR, slices);
        assert!((first_near - NEAR).abs() < 1e-6);
        assert!((last_far - FAR).abs() < 1e-3);

        for k in 0..slices {
            let (z_near, z_far) = slice_depth_bounds(k, NEAR, FAR, slices);
            assert!(z_far > z_near);
            let middle = (z_near * z_far).sqrt();
            assert_eq!(depth_slice(middle, NEAR, FAR, slices), k);
        }
        assert_eq!(depth_slice(0.01, NEAR, FAR, slices), 0);
        assert_eq!(depth_slice(1000.0, NEAR, FAR, slices), slices - 1);
    }

    #[test]
    fn test_cell_aabb_matches_frustum() {
        let projection = Mat4::perspective_rh(90f32.to_radians(), 1.0, 1.0, 16.0);
        let grid = ClusterGridConfig {
            tiles_x: 2,
            tiles_y: 2,
            slices_z: 4,
            max_lights_per_cluster: 4,
        };
        let mut clusterer = LightClusterer::new(grid);
        clusterer
            .update_clusters(&[], Mat4::IDENTITY, projection, 1.0, 16.0)
            .unwrap();

        // Slice 0 spans depth 1..2; tile (0,0) is the lower-left quarter
        let (min, max) = clusterer.cell_aabb(0).unwrap();
        assert!((min - Vec3::new(-2.0, -2.0, -2.0)).length() < 1e-4);
        assert!((max - Vec3::new(0.0, 0.0, -1.0)).length() < 1e-4);

        // Last cell: upper-right quarter of slice 3 (depth 8..16)
        let (min, max) = clusterer.cell_aabb(15).unwrap();
        assert!((min - Vec3::new(0.0, 0.0, -16.0)).length() < 1e-3);
        assert!((max - Vec3::new(16.0, 16.0, -8.0)).length() < 1e-3);
    }

    #[test]
    fn test_cluster_for_matches_assignment() {
        let (view, projection) = camera();
        let lights = scattered_lights(32);
        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&lights, view, projection, NEAR, FAR)
            .unwrap();

        // Every light reaches the cell that contains its own center
        for (index, light) in lights.iter().enumerate() {
            let view_pos = view.transform_point3(light.position);
            let clip = projection * view_pos.extend(1.0);
            let ndc = clip.truncate().truncate() / clip.w;
            if ndc.x.abs() >= 1.0 || ndc.y.abs() >= 1.0 || -view_pos.z <= NEAR {
                continue;
            }
            let cell = clusterer.cluster_for(ndc, -view_pos.z).unwrap();
            let in_cell = clusterer.lights_in_cluster(cell);
            assert!(
                in_cell.contains(&(index as u32)) || in_cell.len() == 32,
                "light {} missing from its own cell {}",
                index,
                cell
            );
        }
    }

    #[test]
    fn test_invalid_clip_range_clears_tables() {
        let (view, projection) = camera();
        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&scattered_lights(8), view, projection, NEAR, FAR)
            .unwrap();
        assert!(clusterer.total_indices() > 0);

        let err = clusterer
            .update_clusters(&scattered_lights(8), view, projection, 10.0, 1.0)
            .unwrap_err();
        assert_eq!(err, DeferredError::InvalidClipRange { near: 10.0, far: 1.0 });
        assert_eq!(clusterer.total_indices(), 0);
        assert!(clusterer.clusters().iter().all(|c| c.count == 0));

        assert!(clusterer
            .update_clusters(&[], view, projection, 0.0, FAR)
            .is_err());
    }

    #[test]
    fn test_invalid_range_forgets_previous_bounds() {
        let (view, projection) = camera();
        let mut clusterer = LightClusterer::default();
        clusterer
            .update_clusters(&scattered_lights(8), view, projection, NEAR, FAR)
            .unwrap();
        assert!(clusterer.cell_aabb(0).is_some());
        assert!(clusterer.cluster_for(Vec2::ZERO, 5.0).is_some());

        assert!(clusterer
            .update_clusters(&scattered_lights(8), view, projection, FAR, NEAR)
            .is_err());
        assert_eq!(clusterer.cell_aabb(0), None);
        assert_eq!(clusterer.cluster_for(Vec2::ZERO, 5.0), None);

        // A valid range rebuilds them
        clusterer
            .update_clusters(&scattered_lights(8), view, projection, NEAR, FAR)
            .unwrap();
        assert!(clusterer.cell_aabb(0).is_some());
    }
}
