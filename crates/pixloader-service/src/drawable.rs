//! Display-ready wrappers around decoded bitmaps.
//!
//! Hosts that track bitmap references themselves use [`StandardDrawable`]. Hosts that don't
//! use [`RecyclingDrawable`], which releases its pixels as soon as it is neither cached nor
//! displayed anymore. The strategy is picked once via [`BitmapTracking`].

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;

use crate::decode::Bitmap;

/// How the host keeps track of bitmaps handed out for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BitmapTracking {
    /// The host tracks bitmap references, drawables are plain wrappers.
    #[default]
    Standard,
    /// Drawables count their cache and display references and recycle their bitmap
    /// once both drop to zero.
    RecyclingAware,
}

/// A decoded bitmap wrapped for display.
pub trait Drawable: fmt::Debug + Send + Sync {
    fn bitmap(&self) -> &Bitmap;

    /// Called when the drawable is put into (`true`) or removed from (`false`) a memory cache.
    fn set_cached(&self, _cached: bool) {}

    /// Called when the drawable starts (`true`) or stops (`false`) being displayed.
    fn set_displayed(&self, _displayed: bool) {}

    /// The cost of keeping this drawable in memory.
    fn weight(&self) -> u32 {
        u32::try_from(self.bitmap().byte_size()).unwrap_or(u32::MAX)
    }
}

pub type DrawableRef = Arc<dyn Drawable>;

#[derive(Debug)]
pub struct StandardDrawable {
    bitmap: Bitmap,
}

impl Drawable for StandardDrawable {
    fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }
}

#[derive(Debug, Default)]
struct References {
    cached: usize,
    displayed: usize,
    has_been_displayed: bool,
}

#[derive(Debug)]
pub struct RecyclingDrawable {
    bitmap: Bitmap,
    refs: Mutex<References>,
}

impl RecyclingDrawable {
    fn update(&self, f: impl FnOnce(&mut References)) {
        let mut refs = self.refs.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut refs);
        if refs.cached == 0 && refs.displayed == 0 && refs.has_been_displayed {
            tracing::trace!("Recycling bitmap that is no longer cached or displayed");
            self.bitmap.recycle();
        }
    }
}

impl Drawable for RecyclingDrawable {
    fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    fn set_cached(&self, cached: bool) {
        self.update(|refs| {
            if cached {
                refs.cached += 1;
            } else {
                refs.cached = refs.cached.saturating_sub(1);
            }
        });
    }

    fn set_displayed(&self, displayed: bool) {
        self.update(|refs| {
            if displayed {
                refs.displayed += 1;
                refs.has_been_displayed = true;
            } else {
                refs.displayed = refs.displayed.saturating_sub(1);
            }
        });
    }
}

trait WrapStrategy: fmt::Debug + Send + Sync {
    fn wrap(&self, bitmap: Bitmap) -> DrawableRef;
}

#[derive(Debug)]
struct Standard;

impl WrapStrategy for Standard {
    fn wrap(&self, bitmap: Bitmap) -> DrawableRef {
        Arc::new(StandardDrawable { bitmap })
    }
}

#[derive(Debug)]
struct Recycling;

impl WrapStrategy for Recycling {
    fn wrap(&self, bitmap: Bitmap) -> DrawableRef {
        Arc::new(RecyclingDrawable {
            bitmap,
            refs: Default::default(),
        })
    }
}

/// Wraps bitmaps using the strategy chosen at construction.
#[derive(Debug)]
pub struct DrawableWrapper {
    strategy: Box<dyn WrapStrategy>,
}

impl DrawableWrapper {
    pub fn for_tracking(tracking: BitmapTracking) -> Self {
        let strategy: Box<dyn WrapStrategy> = match tracking {
            BitmapTracking::Standard => Box::new(Standard),
            BitmapTracking::RecyclingAware => Box::new(Recycling),
        };
        Self { strategy }
    }

    pub fn wrap(&self, bitmap: Bitmap) -> DrawableRef {
        self.strategy.wrap(bitmap)
    }
}
