use anyhow::Result;
use ash::{extensions::ext::DebugUtils, vk};
use log::info;
use std::{
    ffi::{c_void, CStr, CString},
    sync::Arc,
};

#[derive(Default)]
pub struct InstanceBuilder {
    pub graphics_debugging: bool,
}

impl InstanceBuilder {
    pub fn build(self) -> Result<Arc<Instance>> {
        Ok(Arc::new(Instance::create(self)?))
    }

    /// Enables the Khronos validation layer and routes its messages into
    /// the log.
    pub fn graphics_debugging(mut self, graphics_debugging: bool) -> Self {
        self.graphics_debugging = graphics_debugging;
        self
    }
}

pub struct Instance {
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub raw: ash::Instance,
    pub(crate) debug_utils: Option<DebugUtils>,
    #[allow(dead_code)]
    pub(crate) debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
}

impl Instance {
    pub fn builder() -> InstanceBuilder {
        InstanceBuilder::default()
    }

    fn extension_names(builder: &InstanceBuilder) -> Vec<*const i8> {
        let mut names = vec![vk::KhrGetPhysicalDeviceProperties2Fn::name().as_ptr()];

        if builder.graphics_debugging {
            names.push(DebugUtils::name().as_ptr());
        }

        names
    }

    fn layer_names(builder: &InstanceBuilder) -> Vec<CString> {
        let mut layer_names = Vec::new();
        if builder.graphics_debugging {
            layer_names.push(CString::new("VK_LAYER_KHRONOS_validation").unwrap());
        }
        layer_names
    }

    fn create(builder: InstanceBuilder) -> Result<Self> {
        let entry = unsafe { ash::Entry::new()? };

        let instance_extensions = Self::extension_names(&builder);

        let layer_names = Self::layer_names(&builder);
        let layer_names: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name| raw_name.as_ptr())
            .collect();

        let app_desc = vk::ApplicationInfo::builder().api_version(vk::make_api_version(0, 1, 2, 0));

        let instance_desc = vk::InstanceCreateInfo::builder()
            .application_info(&app_desc)
            .enabled_layer_names(&layer_names)
            .enabled_extension_names(&instance_extensions);

        let instance = unsafe { entry.create_instance(&instance_desc, None)? };
        info!("Created a Vulkan instance");

        let (debug_utils, debug_messenger) = if builder.graphics_debugging {
            let debug_utils = DebugUtils::new(&entry, &instance);

            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));

            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&messenger_info, None)? };

            (Some(debug_utils), Some(messenger))
        } else {
            (None, None)
        };

        Ok(Self {
            entry,
            raw: instance,
            debug_utils,
            debug_messenger,
        })
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("{}\n", message);
    } else {
        log::warn!("{}\n", message);
    }

    vk::FALSE
}
