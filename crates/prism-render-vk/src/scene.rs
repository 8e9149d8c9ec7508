// SPDX-License-Identifier: CEPL-1.0
use std::collections::HashMap;

use crate::cache::ResourceId;
use crate::camera::Camera;
use crate::device::Device;
use crate::mesh::Mesh;

struct Entry<D: Device> {
    name: String,
    mesh: Mesh<D>,
}

/// What the drawing systems read each frame.
pub struct Scene<D: Device> {
    meshes: HashMap<ResourceId, Entry<D>>,
    camera: Camera,
    clear_color: [f32; 4],
}

impl<D: Device> Scene<D> {
    pub fn new(clear_color: [f32; 4]) -> Self {
        Scene {
            meshes: HashMap::new(),
            camera: Camera::default(),
            clear_color,
        }
    }

    /// Adds `mesh` under `name`, replacing a previous mesh of the same name.
    pub fn add_mesh(&mut self, name: &str, mesh: Mesh<D>) -> ResourceId {
        let id = ResourceId::from_name(name);
        self.meshes.insert(
            id,
            Entry {
                name: name.to_owned(),
                mesh,
            },
        );
        id
    }

    pub fn mesh(&self, id: ResourceId) -> Option<&Mesh<D>> {
        self.meshes.get(&id).map(|e| &e.mesh)
    }

    /// The GPU may still read the returned buffers until in-flight frames finish.
    pub fn remove_mesh(&mut self, id: ResourceId) -> Option<Mesh<D>> {
        self.meshes.remove(&id).map(|e| e.mesh)
    }

    pub fn meshes(&self) -> impl Iterator<Item = (ResourceId, &str, &Mesh<D>)> {
        self.meshes
            .iter()
            .map(|(id, e)| (*id, e.name.as_str(), &e.mesh))
    }

    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn set_camera(&mut self, camera: Camera) {
        self.camera = camera;
    }

    pub fn clear_color(&self) -> [f32; 4] {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = rgba;
    }
}
