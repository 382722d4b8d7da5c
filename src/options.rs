//! Contains all of the types needed to specify options to operations.
//!
//! Most of the options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a type-safe builder
//! API on them. For example, to create an instance of
//! [`ClientOptions`](struct.ClientOptions.html) with only `app_name` and `max_pool_size` set, the
//! builder API can be used as follows:
//!
//! ```rust
//! # use mongodb_core::options::ClientOptions;
//! #
//! # let options = ClientOptions::builder()
//! #                   .app_name("inventory".to_string())
//! #                   .max_pool_size(20u32)
//! #                   .build();
//! ```

pub use crate::{
    change_stream::options::*,
    client::options::*,
    concern::*,
    db::options::*,
    selection_criteria::*,
};

/// Merges the options from src into dst.
macro_rules! merge_options {
    ($src:expr, $dst:expr, [$( $field:ident ),+] ) => {
        $(
            if let Some(ref option) = $src.$field {
                if !$dst.$field.is_some() {
                    $dst.$field = Some(option.clone());
                }
            }
        )+
    };
}
