//! Bindings of the libibverbs interfaces used by the hardware provider.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(deref_nullptr)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::too_many_arguments)]
#![allow(unused)]

mod common;

mod private {
    use libc::*;

    pub use super::common::*;
    include!(concat!(env!("OUT_DIR"), "/verbs_bindings.rs"));
}

pub(crate) use self::private::*;
