//! Routing of steady-state frames read from a client.

use courier_core::error::log_failure;
use courier_proto::{Frame, Recipient};

use crate::{config::RoutingLevel, server::Shared, session::ClientConnection};

/// Where a client-originated message or reply goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Server's own dispatch table or reply registry
    Local,
    /// Every other live connection
    Broadcast,
    /// Every connection registered under the name
    Direct(String),
    /// Forwarding refused by the routing level
    Denied,
}

impl Route {
    /// Decide the route for a recipient under `level`.
    pub fn decide(level: RoutingLevel, recipient: &str) -> Self {
        match Recipient::parse(recipient) {
            Recipient::Server => Self::Local,
            Recipient::All if level.allows_broadcast() => Self::Broadcast,
            Recipient::Named(name) if level.allows_direct() => Self::Direct(name.to_string()),
            Recipient::All | Recipient::Named(_) => Self::Denied,
        }
    }
}

/// Handle one frame read from `origin` after the handshake.
pub(crate) async fn route(shared: &Shared, origin: &ClientConnection, frame: Frame) {
    match frame {
        Frame::Action(action) => {
            let _ = shared.dispatcher.handle_action(action, origin.clone()).await;
        },
        Frame::Message(mut message) => {
            origin.name().clone_into(&mut message.sender);
            match Route::decide(shared.config.routing_level, &message.recipient) {
                Route::Local => {
                    let _ = shared.dispatcher.handle_message(message, origin.clone()).await;
                },
                route => forward(shared, origin, route, Frame::Message(message)),
            }
        },
        Frame::Reply(mut reply) => {
            origin.name().clone_into(&mut reply.sender);
            match Route::decide(shared.config.routing_level, &reply.recipient) {
                Route::Local => {
                    let _ = shared.dispatcher.handle_reply(reply);
                },
                route => forward(shared, origin, route, Frame::Reply(reply)),
            }
        },
        Frame::AuthRequest(_) | Frame::AuthResponse(_) => {
            tracing::debug!(name = %origin.name(), kind = %frame.kind(), "handshake frame after handshake");
        },
    }
}

fn forward(shared: &Shared, origin: &ClientConnection, route: Route, frame: Frame) {
    let targets: Vec<ClientConnection> = match route {
        Route::Broadcast => {
            shared.sessions.get_all_users().into_iter().filter(|c| c != origin).collect()
        },
        Route::Direct(name) => shared.sessions.get_user(&name),
        Route::Denied => {
            tracing::debug!(name = %origin.name(), level = %shared.config.routing_level, "forwarding denied");
            return;
        },
        Route::Local => return,
    };

    if targets.is_empty() {
        tracing::debug!(name = %origin.name(), kind = %frame.kind(), "no recipient connected");
    }
    for target in targets {
        if let Err(e) = target.deliver(&frame) {
            log_failure(shared.config.debug, "forward failed", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_is_always_local() {
        for level in [RoutingLevel::Nothing, RoutingLevel::Single, RoutingLevel::All] {
            assert_eq!(Route::decide(level, "server"), Route::Local);
            assert_eq!(Route::decide(level, "SERVER"), Route::Local);
        }
    }

    #[test]
    fn nothing_forwards_nothing() {
        assert_eq!(Route::decide(RoutingLevel::Nothing, "bob"), Route::Denied);
        assert_eq!(Route::decide(RoutingLevel::Nothing, "all"), Route::Denied);
    }

    #[test]
    fn single_forwards_named_only() {
        assert_eq!(Route::decide(RoutingLevel::Single, "bob"), Route::Direct("bob".into()));
        assert_eq!(Route::decide(RoutingLevel::Single, "all"), Route::Denied);
    }

    #[test]
    fn all_forwards_named_and_broadcast() {
        assert_eq!(Route::decide(RoutingLevel::All, "bob"), Route::Direct("bob".into()));
        assert_eq!(Route::decide(RoutingLevel::All, "All"), Route::Broadcast);
    }
}
