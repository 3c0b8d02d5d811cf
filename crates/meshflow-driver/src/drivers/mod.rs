/*!
 * Concrete drivers for MeshFlow.
 */

pub mod light;

pub use light::{light_driver, LightHooks, LIGHT_DEVICE_CLASS, LIGHT_DRIVER_NAME};
