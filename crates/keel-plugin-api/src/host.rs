//! Host subsystem capability handles
//!
//! The runtime never looks inside these; it only hands them to plugins that
//! hold the matching [`Permission`](crate::Permission). Hosts downcast through
//! `as_any` to reach their concrete types.

use std::any::Any;
use std::fmt;

/// ECS world / registry, gated by `EngineCoreAccess`
pub trait EcsWorld: Send + Sync + fmt::Debug {
    /// Concrete host type
    fn as_any(&self) -> &dyn Any;
}

/// Renderer, gated by `RenderingAccess`
pub trait Renderer: Send + Sync + fmt::Debug {
    /// Concrete host type
    fn as_any(&self) -> &dyn Any;
}

/// Asset manager, gated by `AssetAccess`
pub trait AssetManager: Send + Sync + fmt::Debug {
    /// Concrete host type
    fn as_any(&self) -> &dyn Any;
}

/// GUI manager, gated by `GuiAccess`
pub trait GuiManager: Send + Sync + fmt::Debug {
    /// Concrete host type
    fn as_any(&self) -> &dyn Any;
}
