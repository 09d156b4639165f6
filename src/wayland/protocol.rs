//! Client bindings for the `lipstick_recorder` compositor extension

#![allow(dead_code, non_camel_case_types, non_upper_case_globals, unused_imports)]
#![allow(clippy::all)]

use wayland_client;
use wayland_client::protocol::*;

pub mod __interfaces {
    use wayland_client::protocol::__interfaces::*;
    wayland_scanner::generate_interfaces!("protocol/lipstick-recorder.xml");
}
use self::__interfaces::*;

wayland_scanner::generate_client_code!("protocol/lipstick-recorder.xml");
