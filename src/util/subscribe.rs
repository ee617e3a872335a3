use std::sync::Arc;

/// A callback invoked whenever the thing it is subscribed to changes.
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Returned by `subscribe`; dropping it does nothing, calling it detaches the listener.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;
