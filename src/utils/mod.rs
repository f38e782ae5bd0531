pub mod addr;

pub use addr::{network_address, parse_cidr, prefix_to_netmask};
