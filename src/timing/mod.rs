pub mod clock;
pub mod frame_counter;
pub mod pacer;
pub mod pdf;
pub mod token_bucket;
