// File mapping layer: the mapped region abstraction, the shared control
// block that lets duplicated handles follow remaps, and the windowed
// mapping used when a file should not be pinned whole.

mod file;
mod shared;
mod window;

pub use file::{sys_page_size, MappedRegion};
pub use shared::{MapState, SharedMap};
pub use window::WindowData;
