//! CI script used for stagepool, runnable locally with `cargo run -p ci`.

mod ci;
mod commands;
mod prepare;

pub use self::{ci::*, prepare::*};

fn main() {
    argh::from_env::<CI>().run();
}
