// SPDX-License-Identifier: CEPL-1.0
use anyhow::{anyhow, Context, Result};
use ash::khr::{surface, swapchain};
use ash::{vk, Entry, Instance};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::ash_device::AshDevice;
use crate::device::QueueFamilies;

unsafe fn create_instance(entry: &Entry, display_raw: RawDisplayHandle) -> Result<Instance> {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"prism")
        .engine_name(c"prism")
        .api_version(vk::API_VERSION_1_0);

    let extensions = ash_window::enumerate_required_extensions(display_raw)
        .context("enumerate_required_extensions")?;

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(extensions);

    Ok(unsafe { entry.create_instance(&create_info, None) }.context("create_instance")?)
}

/// First device with a graphics family, a present-capable family and the
/// swapchain extension. Discrete GPUs are tried first.
unsafe fn pick_device(
    instance: &Instance,
    surface_loader: &surface::Instance,
    surface: vk::SurfaceKHR,
) -> Result<(vk::PhysicalDevice, QueueFamilies)> {
    let mut devices = unsafe { instance.enumerate_physical_devices() }?;
    devices.sort_by_key(|&phys| {
        let props = unsafe { instance.get_physical_device_properties(phys) };
        props.device_type != vk::PhysicalDeviceType::DISCRETE_GPU
    });

    for phys in devices {
        let has_swapchain = unsafe { instance.enumerate_device_extension_properties(phys) }?
            .iter()
            .any(|ext| ext.extension_name_as_c_str() == Ok(swapchain::NAME));
        if !has_swapchain {
            continue;
        }

        let qprops = unsafe { instance.get_physical_device_queue_family_properties(phys) };
        let presents = |i: u32| unsafe {
            surface_loader
                .get_physical_device_surface_support(phys, i, surface)
                .unwrap_or(false)
        };
        let graphics: Vec<u32> = qprops
            .iter()
            .enumerate()
            .filter(|(_, q)| q.queue_flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|(i, _)| i as u32)
            .collect();

        // prefer one family doing both
        if let Some(&both) = graphics.iter().find(|&&i| presents(i)) {
            return Ok((phys, QueueFamilies { graphics: both, present: both }));
        }
        let present = (0..qprops.len() as u32).find(|&i| presents(i));
        if let (Some(&graphics), Some(present)) = (graphics.first(), present) {
            return Ok((phys, QueueFamilies { graphics, present }));
        }
    }
    Err(anyhow!("no suitable physical device/queue family"))
}

unsafe fn build(
    entry: Entry,
    instance: Instance,
    surface_loader: surface::Instance,
    surface: vk::SurfaceKHR,
) -> std::result::Result<AshDevice, (anyhow::Error, Entry, Instance, surface::Instance)> {
    let picked = unsafe { pick_device(&instance, &surface_loader, surface) };
    let (phys, families) = match picked {
        Ok(p) => p,
        Err(e) => return Err((e, entry, instance, surface_loader)),
    };

    let props = unsafe { instance.get_physical_device_properties(phys) };
    info!(
        "Vulkan device: {} (graphics family {}, present family {})",
        props
            .device_name_as_c_str()
            .ok()
            .and_then(|n| n.to_str().ok())
            .unwrap_or("unknown"),
        families.graphics,
        families.present
    );

    let priorities = [1.0_f32];
    let mut queue_infos = vec![vk::DeviceQueueCreateInfo::default()
        .queue_family_index(families.graphics)
        .queue_priorities(&priorities)];
    if !families.is_shared() {
        queue_infos.push(
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(families.present)
                .queue_priorities(&priorities),
        );
    }
    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&device_exts);

    let device = match unsafe { instance.create_device(phys, &dinfo, None) } {
        Ok(d) => d,
        Err(e) => {
            let e = anyhow::Error::from(e).context("create_device");
            return Err((e, entry, instance, surface_loader));
        }
    };

    let allocator = match Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device: phys,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    }) {
        Ok(a) => a,
        Err(e) => {
            unsafe { device.destroy_device(None) };
            let e = anyhow::Error::from(e).context("create allocator");
            return Err((e, entry, instance, surface_loader));
        }
    };

    let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
    let present_queue = unsafe { device.get_device_queue(families.present, 0) };
    let swapchain_loader = swapchain::Device::new(&instance, &device);

    Ok(AshDevice {
        _entry: entry,
        instance,
        surface_loader,
        surface,
        phys,
        device,
        swapchain_loader,
        families,
        graphics_queue,
        present_queue,
        allocator: Some(Mutex::new(allocator)),
    })
}

/// Instance, surface, physical/logical device, queues and allocator for a window.
pub fn create_device(
    window: &dyn HasWindowHandle,
    display: &dyn HasDisplayHandle,
) -> Result<Arc<AshDevice>> {
    let entry = Entry::linked();

    let dh = display.display_handle()?.as_raw();
    let wh = window.window_handle()?.as_raw();

    let instance = unsafe { create_instance(&entry, dh) }?;
    let surface = match unsafe { ash_window::create_surface(&entry, &instance, dh, wh, None) } {
        Ok(s) => s,
        Err(e) => {
            unsafe { instance.destroy_instance(None) };
            return Err(anyhow::Error::from(e).context("create_surface"));
        }
    };
    let surface_loader = surface::Instance::new(&entry, &instance);

    match unsafe { build(entry, instance, surface_loader, surface) } {
        Ok(device) => Ok(Arc::new(device)),
        Err((e, _entry, instance, surface_loader)) => {
            unsafe {
                surface_loader.destroy_surface(surface, None);
                instance.destroy_instance(None);
            }
            Err(e)
        }
    }
}
