pub mod cancel;
pub mod chord;
pub mod hold;
pub mod port_lane;
