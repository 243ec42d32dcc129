pub mod random;
pub mod sample_window;

pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use sample_window::SampleWindow;
