pub mod decoder;
pub mod frame;
pub mod grabber;
pub mod sequence;
pub mod source;
pub mod synchronizer;
pub mod synthetic;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use frame::{Eye, EyeCollection, Frame, FrameMetadata, FrameSet, PixelFormat};
pub use grabber::{FrameSetCallback, GrabberOptions, GrabberStats, ImageGrabber};
pub use source::{Direction, FrameSource, Grab, MovableSource, SourceMode, SourceRegistry};
pub use synchronizer::{MultiSourceSynchronizer, SyncOutcome};
pub use synthetic::{ScriptedSource, SyntheticSource};
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;
