//! Engine lifecycle state machine.
//!
//! Pure transitions for `MeshNode`: the node feeds lifecycle events in and
//! executes the returned actions in order. Invalid transitions leave the
//! state untouched and produce no actions, which is what makes repeated
//! `stop()` calls no-ops.

/// Lifecycle state of a mesh engine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineState {
    /// Not listening, no background tasks.
    #[default]
    Stopped,
    /// Identity loaded, transport coming up.
    Starting,
    /// Transport up, handlers registered, event loop running.
    Running,
    /// Tearing down tasks and transport.
    Stopping,
}

impl EngineState {
    /// Create a new state machine in the Stopped state.
    pub fn new() -> Self {
        Self::Stopped
    }

    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: LifecycleEvent) -> (Self, Vec<Action>) {
        match (self, event) {
            (Self::Stopped, LifecycleEvent::StartRequested) => {
                (Self::Starting, vec![Action::StartTransport])
            }

            (Self::Starting, LifecycleEvent::StartSucceeded) => (
                Self::Running,
                vec![
                    Action::RegisterHandlers,
                    Action::SpawnEventLoop,
                    Action::EmitStarted,
                ],
            ),
            (Self::Starting, LifecycleEvent::StartFailed) => {
                (Self::Stopped, vec![Action::StopTransport])
            }

            (Self::Running, LifecycleEvent::StopRequested) => (
                Self::Stopping,
                vec![Action::AbortTasks, Action::StopTransport],
            ),

            (Self::Stopping, LifecycleEvent::StopCompleted) => (
                Self::Stopped,
                vec![Action::ClearRegistry, Action::EmitStopped],
            ),

            (state, _) => (state, vec![]),
        }
    }

    /// True only in `Running`; sends are refused in every other state.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// True while a start or stop is in flight.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }
}

/// Inputs to the lifecycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Host called `start()`.
    StartRequested,
    /// Transport is listening.
    StartSucceeded,
    /// Transport failed to start.
    StartFailed,
    /// Host called `stop()`.
    StopRequested,
    /// Tasks aborted and transport stopped.
    StopCompleted,
}

/// Side effects the engine must perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Start the transport with the node identity.
    StartTransport,
    /// Register the `sync-request` and `inventory-data` handlers.
    RegisterHandlers,
    /// Spawn the transport event loop.
    SpawnEventLoop,
    /// Notify subscribers that the node is up.
    EmitStarted,
    /// Abort the event loop and pending auto-pushes.
    AbortTasks,
    /// Stop the transport.
    StopTransport,
    /// Drop all registry entries.
    ClearRegistry,
    /// Notify subscribers that the node is down.
    EmitStopped,
}
