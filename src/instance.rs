// Vulkan instance bring-up
//
// This holds the common instance-level Vulkan state: the entry point,
// the instance itself, and the debug messenger. This crate is headless
// (no swapchain/surface), so unlike the teacher's `Instance` there is no
// windowing-system extension negotiation here.
//
// Austin Shafer - 2024

use ash::extensions::ext;
use ash::{vk, Entry};

extern crate utils as cat5_utils;
use crate::error::Result;
use cat5_utils::log;

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// Instance bring-up options.
///
/// Kept deliberately small: this crate has no windowing surface to
/// negotiate extensions against, so the only knob that matters at
/// instance scope is whether to enable validation.
pub struct InstanceCreateInfo {
    /// Enable `VK_LAYER_KHRONOS_validation` and synchronization
    /// validation on top of it. Defaults to on for debug builds.
    pub enable_validation: bool,
}

impl Default for InstanceCreateInfo {
    fn default() -> Self {
        Self {
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. `GpuContext` uses this to
/// create the `Device` it needs internally.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,

    /// the entry just loads function pointers from the dynamic library
    /// I am calling it a loader, because that's what it does
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe { dr_loader.create_debug_utils_messenger(&debug_info, None)? };
        Ok((dr_loader, callback))
    }

    /// Create a vkInstance
    ///
    /// Most of the create info entries are straightforward, with the
    /// debug utils extension and (optionally) validation layers
    /// enabled. All of the work is done in subfunctions.
    pub fn new(info: &InstanceCreateInfo) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("rtcore").unwrap();

        let layer_names = if info.enable_validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let extension_names_raw = vec![ext::DebugUtils::name().as_ptr()];

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let validation_features = vk::ValidationFeaturesEXT::builder()
            .enabled_validation_features(&[
                vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
            ])
            .build();
        if info.enable_validation {
            create_info.p_next = &validation_features as *const _ as *const std::os::raw::c_void;
        }

        let instance: ash::Instance = unsafe { entry.create_instance(&create_info, None)? };

        let (dr_loader, d_callback) = Self::setup_debug(&entry, &instance)?;

        Ok(Self {
            loader: entry,
            inst: instance,
            debug_loader: dr_loader,
            debug_callback: d_callback,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.debug_loader
                .destroy_debug_utils_messenger(self.debug_callback, None);
            self.inst.destroy_instance(None);
        }
    }
}
