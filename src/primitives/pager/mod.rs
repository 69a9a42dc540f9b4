#![forbid(unsafe_code)]

mod frame;
mod pager;

pub use pager::{PageSpan, PageSpanMut, Pager, PagerOptions, PagerStats};
