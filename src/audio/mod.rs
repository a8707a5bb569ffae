//! # Audio Module
//!
//! Per-chat music queues and the scheduler that consumes them.
//!
//! Playback is simulated: a track "plays" for its duration (or the configured
//! default when the provider did not report one) and the loop moves on.
//!
//! ### [`queue`] - Queue state
//! - FIFO pending tracks plus the "now playing" slot
//! - Generation counter and loop guard that keep one consumer per chat
//!
//! ### [`player`] - Scheduler
//! - `enqueue`/`pause`/`resume`/`skip`/`stop` per chat
//! - Announces tracks, records play counts, retries after failures
//!
//! ```ignore
//! # use std::sync::Arc;
//! # async fn example(scheduler: Arc<slayer_bot::audio::player::PlaybackScheduler>, track: slayer_bot::sources::Track) {
//! let chat_id = -1001234567890;
//! scheduler.enqueue(chat_id, track).await.ok();
//! scheduler.pause(chat_id).await.ok();
//! scheduler.resume(chat_id).await.ok();
//! scheduler.stop(chat_id).await;
//! # }
//! ```

pub mod player;
pub mod queue;
