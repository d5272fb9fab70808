//! Data structures shared by the scheduler and the primitives built on it.
//!
//! **Exempt from the crate's API stability guarantee.**

pub mod cib;
pub mod intrusive_list;
pub mod prio_bitmap;

pub use cib::Cib;
pub use intrusive_list::{CircularList, Linked, SortedList};
pub use prio_bitmap::{PrioBitmap, PriorityBitmap};
