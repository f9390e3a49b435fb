//! rehook's own services that sit beside the injection core: user settings and the theme
//! inventory.

pub mod settings;
pub mod themes;
