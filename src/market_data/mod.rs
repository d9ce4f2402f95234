pub mod candle_stream;

pub use candle_stream::run_candle_stream;
