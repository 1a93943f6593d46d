//! Server side of the authentication handshake.
//!
//! The first frame on a connection must be a credential frame. It is checked
//! in a fixed order and answered with exactly one `AuthResponse`:
//!
//! 1. global connection cap → `MAX_GLOBAL_CLIENT`
//! 2. reserved name (`server`, `all`) → `FORBIDDEN`
//! 3. per-name connection cap → `MAX_SAME_CLIENT`
//! 4. credential verification → `INVALID`
//!
//! The caps are checked again when the session is registered, under the
//! registry lock, because other handshakes may have completed meanwhile.
//! Anything but `OK` is followed by closing the connection.

use std::sync::Arc;

use courier_core::{Authenticator, Connection, ConnectionError, error::log_failure};
use courier_proto::{AuthCode, AuthResponse, Credentials, Frame, Recipient};

use crate::{config::ServerConfig, registry::SessionRegistry, server::Shared, session::ClientConnection};

/// Validate `credentials` against the current registry occupancy.
///
/// Empty names cannot address anyone and are treated as malformed.
pub fn check_credentials(
    credentials: &Credentials,
    sessions: &SessionRegistry,
    config: &ServerConfig,
    authenticator: &dyn Authenticator,
) -> AuthCode {
    if credentials.name.is_empty() {
        return AuthCode::Malformed;
    }
    if sessions.count() >= config.max_clients {
        return AuthCode::MaxGlobalClient;
    }
    if Recipient::is_reserved(&credentials.name) {
        return AuthCode::Forbidden;
    }
    if sessions.user_count(&credentials.name) >= config.max_same_client {
        return AuthCode::MaxSameClient;
    }
    if !authenticator.verify(credentials) {
        return AuthCode::Invalid;
    }
    AuthCode::Ok
}

/// Run the handshake on a fresh connection.
///
/// Returns the registered session on success. On failure the connection has
/// been answered (where possible) and closed.
pub(crate) async fn accept(shared: &Arc<Shared>, connection: Connection) -> Option<ClientConnection> {
    let debug = shared.config.debug;
    if let Err(e) = connection.begin_handshake() {
        log_failure(debug, "handshake on unusable connection", &e);
        return None;
    }

    let credentials = match connection.recv_timeout(shared.config.handshake_timeout).await {
        Ok(Frame::AuthRequest(credentials)) => credentials,
        Ok(other) => {
            tracing::debug!(peer = ?connection.peer_addr(), kind = %other.kind(), "expected credentials");
            reject(&connection, AuthCode::Malformed, debug).await;
            return None;
        },
        Err(e) if e.is_recoverable() => {
            log_failure(debug, "undecodable credential frame", &e);
            reject(&connection, AuthCode::Malformed, debug).await;
            return None;
        },
        Err(ConnectionError::Timeout(limit)) => {
            tracing::debug!(peer = ?connection.peer_addr(), ?limit, "handshake timed out");
            connection.shutdown().await;
            return None;
        },
        Err(e) => {
            log_failure(debug, "handshake read failed", &e);
            connection.shutdown().await;
            return None;
        },
    };

    let code =
        check_credentials(&credentials, &shared.sessions, &shared.config, shared.authenticator.as_ref());
    if !code.is_ok() {
        tracing::info!(name = %credentials.name, peer = ?connection.peer_addr(), %code, "session rejected");
        reject(&connection, code, debug).await;
        return None;
    }

    let client = ClientConnection::new(
        shared.next_connection_id(),
        credentials.name,
        credentials.group,
        connection,
        Arc::clone(&shared.dispatcher),
        shared.config.outbound_capacity,
    );

    if let Err(code) =
        shared.sessions.try_register(client.clone(), shared.config.max_clients, shared.config.max_same_client)
    {
        tracing::info!(name = %client.name(), %code, "session rejected at registration");
        reject(client.connection(), code, debug).await;
        return None;
    }

    let accepted = Frame::AuthResponse(AuthResponse { code: AuthCode::Ok });
    let opened = match client.connection().send(&accepted).await {
        Ok(()) => client.connection().mark_open(),
        Err(e) => Err(e),
    };
    if let Err(e) = opened {
        log_failure(debug, "failed to confirm session", &e);
        let _ = shared.sessions.remove(&client);
        client.connection().shutdown().await;
        return None;
    }

    tracing::info!(
        name = %client.name(),
        group = %client.group(),
        id = client.id(),
        peer = ?client.peer_addr(),
        "session opened"
    );
    Some(client)
}

async fn reject(connection: &Connection, code: AuthCode, debug: bool) {
    let response = Frame::AuthResponse(AuthResponse { code });
    if let Err(e) = connection.send(&response).await {
        log_failure(debug, "failed to send rejection", &e);
    }
    connection.shutdown().await;
}

#[cfg(test)]
mod tests {
    use courier_core::{AllowAll, TokenVerifier};

    use super::*;
    use crate::session::tests::open_session;

    fn config(max_clients: usize, max_same_client: usize) -> ServerConfig {
        ServerConfig { max_clients, max_same_client, ..ServerConfig::default() }
    }

    #[test]
    fn valid_token_is_accepted() {
        let verifier = TokenVerifier::new("key");
        let code = check_credentials(
            &verifier.credentials("alice", "default"),
            &SessionRegistry::new(),
            &config(50, 10),
            &verifier,
        );
        assert_eq!(code, AuthCode::Ok);
    }

    #[test]
    fn bad_token_is_invalid() {
        let verifier = TokenVerifier::new("key");
        let credentials = Credentials::new("alice", "nope");
        let code = check_credentials(&credentials, &SessionRegistry::new(), &config(50, 10), &verifier);
        assert_eq!(code, AuthCode::Invalid);
    }

    #[test]
    fn reserved_names_are_forbidden_in_any_case() {
        for name in ["server", "ALL", "Server"] {
            let credentials = Credentials::new(name, "");
            let code = check_credentials(&credentials, &SessionRegistry::new(), &config(50, 10), &AllowAll);
            assert_eq!(code, AuthCode::Forbidden, "{name}");
        }
    }

    #[test]
    fn empty_name_is_malformed() {
        let code =
            check_credentials(&Credentials::new("", ""), &SessionRegistry::new(), &config(50, 10), &AllowAll);
        assert_eq!(code, AuthCode::Malformed);
    }

    #[tokio::test]
    async fn checks_run_in_order() {
        let sessions = SessionRegistry::new();
        let (alice, _peer) = open_session(1, "alice");
        assert!(sessions.add(alice));

        // Global cap wins over the reserved name.
        let code = check_credentials(&Credentials::new("server", ""), &sessions, &config(1, 10), &AllowAll);
        assert_eq!(code, AuthCode::MaxGlobalClient);

        // Reserved name wins over the per-name cap.
        let code = check_credentials(&Credentials::new("all", ""), &sessions, &config(50, 0), &AllowAll);
        assert_eq!(code, AuthCode::Forbidden);

        // Per-name cap wins over verification.
        let deny = |_: &Credentials| false;
        let code = check_credentials(&Credentials::new("alice", ""), &sessions, &config(50, 1), &deny);
        assert_eq!(code, AuthCode::MaxSameClient);

        let code = check_credentials(&Credentials::new("alice", ""), &sessions, &config(50, 2), &deny);
        assert_eq!(code, AuthCode::Invalid);
    }
}
