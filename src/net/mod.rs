//! Device/network vocabulary: NIC address parsing and rank&lt;-&gt;address maps.

mod addr;
mod key;

pub use addr::*;
pub use key::*;
