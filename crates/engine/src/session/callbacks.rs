//! The session's user-facing capability set.
//!
//! Game code plugs in here: room setup, player spawn/despawn on lifecycle
//! transitions, and a per-tick observer. Lifecycle callbacks run inside
//! the tick, so their effects are snapshotted and participate in rollback.

use crate::store::world::Frame;
use crate::store::Store;

type RoomFn = Box<dyn FnMut(&mut Store)>;
type ClientFn = Box<dyn FnMut(&mut Store, &str)>;
type TickFn = Box<dyn FnMut(&mut Store, Frame)>;

#[derive(Default)]
pub struct SessionCallbacks {
    pub(crate) on_room_create: Option<RoomFn>,
    pub(crate) on_connect: Option<ClientFn>,
    pub(crate) on_disconnect: Option<ClientFn>,
    pub(crate) on_tick: Option<TickFn>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs once when the room is created (local start, or first frame of
    /// a hosted room).
    pub fn on_room_create(mut self, f: impl FnMut(&mut Store) + 'static) -> Self {
        self.on_room_create = Some(Box::new(f));
        self
    }

    /// Runs at the frame a client's join input takes effect — spawn the
    /// player here.
    pub fn on_connect(mut self, f: impl FnMut(&mut Store, &str) + 'static) -> Self {
        self.on_connect = Some(Box::new(f));
        self
    }

    /// Runs at the frame a client's leave input takes effect.
    pub fn on_disconnect(mut self, f: impl FnMut(&mut Store, &str) + 'static) -> Self {
        self.on_disconnect = Some(Box::new(f));
        self
    }

    /// Observer invoked after every simulated frame.
    pub fn on_tick(mut self, f: impl FnMut(&mut Store, Frame) + 'static) -> Self {
        self.on_tick = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_room_create", &self.on_room_create.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_tick", &self.on_tick.is_some())
            .finish()
    }
}
