//! Compiled-in transforms and operation filters.
//!
//! Measurements reference implementations by name (`transform = "..."`,
//! `filter = "..."` in the config file); unknown names fail startup. This is
//! where deployment-specific implementations get registered, either as
//! closures or as types implementing [`mongoflux_core::DocTransform`] /
//! [`mongoflux_core::OpFilter`].

use mongoflux_core::TransformRegistry;

pub fn registry() -> TransformRegistry {
    TransformRegistry::new()
}
