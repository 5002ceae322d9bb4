//! Ordered message handler subscriptions
//!
//! Every message is offered to each handler in registration order. A
//! handler returning `true` is detached after the pass, which serves both
//! one-shot "await this reply" handlers and long-lived stream pumps.
//! Handlers may register further handlers while running; those join the
//! list after the current pass and see the next message.

use meshgate_proto::Message;
use parking_lot::Mutex;

type Handler<C> = Box<dyn FnMut(&C, &Message) -> bool + Send>;

pub struct HandlerList<C> {
    /// Serialises passes so handlers never run concurrently
    dispatch: Mutex<()>,
    handlers: Mutex<Vec<Handler<C>>>,
}

impl<C> HandlerList<C> {
    pub fn new() -> Self {
        Self {
            dispatch: Mutex::new(()),
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn add<F>(&self, handler: F)
    where
        F: FnMut(&C, &Message) -> bool + Send + 'static,
    {
        self.handlers.lock().push(Box::new(handler));
    }

    /// Handlers currently registered, excluding any taken out by a running pass
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offer `msg` to every handler; must not be called from inside a handler
    pub fn dispatch(&self, context: &C, msg: &Message) {
        let _pass = self.dispatch.lock();

        let mut current = std::mem::take(&mut *self.handlers.lock());
        current.retain_mut(|handler| !handler(context, msg));

        let mut handlers = self.handlers.lock();
        let added = std::mem::replace(&mut *handlers, current);
        handlers.extend(added);
    }

    pub fn clear(&self) {
        let _pass = self.dispatch.lock();
        self.handlers.lock().clear();
    }
}

impl<C> Default for HandlerList<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn close(channel_id: u32) -> Message {
        Message::Close { channel_id }
    }

    #[test]
    fn test_one_shot_handler_detaches() {
        let list: HandlerList<()> = HandlerList::new();
        let hits = Arc::new(Mutex::new(Vec::new()));

        let seen = hits.clone();
        list.add(move |_, msg| {
            seen.lock().push(("once", msg.channel_id()));
            msg.channel_id() == 7
        });
        let seen = hits.clone();
        list.add(move |_, msg| {
            seen.lock().push(("always", msg.channel_id()));
            false
        });

        list.dispatch(&(), &close(1));
        list.dispatch(&(), &close(7));
        list.dispatch(&(), &close(8));

        assert_eq!(
            *hits.lock(),
            vec![
                ("once", 1),
                ("always", 1),
                ("once", 7),
                ("always", 7),
                ("always", 8)
            ]
        );
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_handlers_added_mid_pass_see_next_message() {
        let list: Arc<HandlerList<()>> = Arc::new(HandlerList::new());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let registrar = list.clone();
        let seen = hits.clone();
        list.add(move |_, msg| {
            let seen = seen.clone();
            registrar.add(move |_, inner| {
                seen.lock().push(inner.channel_id());
                true
            });
            msg.channel_id() == 1
        });

        list.dispatch(&(), &close(1));
        assert!(hits.lock().is_empty());
        assert_eq!(list.len(), 1);

        list.dispatch(&(), &close(2));
        assert_eq!(*hits.lock(), vec![2]);
        assert!(list.is_empty());
    }

    #[test]
    fn test_context_is_passed_through() {
        let list: HandlerList<u32> = HandlerList::new();
        let total = Arc::new(Mutex::new(0u32));
        let sum = total.clone();
        list.add(move |ctx, _| {
            *sum.lock() += *ctx;
            false
        });

        list.dispatch(&5, &close(0));
        list.dispatch(&3, &close(0));
        assert_eq!(*total.lock(), 8);
    }
}
