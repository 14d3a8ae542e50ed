//! The six cooperating tasks that make up a running master.

pub mod bigbrother;
pub mod build_catcher;
pub mod index_scribbler;
pub mod scraper;
pub mod slave_driver;
pub mod stuffer;
