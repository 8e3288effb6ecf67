//! UI-facing operations. Each returns JSON or a plain error string so the
//! host layer can hand results straight to the frontend.

pub mod mirror;

pub use mirror::{
    force_resync, get_branding_image, get_mirror_config, get_mirrored_data, mirror_status,
    set_mirror_config, sync_mirrored_data,
};
