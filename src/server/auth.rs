use axum::{
    body::Body,
    extract::State,
    http::{header, Request, Response, StatusCode},
    middleware::Next,
};
use base64::Engine;
use cargit_git::{GitProtocolServer, PersonIdent};

#[derive(Clone)]
pub struct AppState {
    pub git: GitProtocolServer,
    pub auth: Option<AuthCredentials>,
}

#[derive(Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

/// Authenticated user of a request, stored as a request extension.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
}

impl Principal {
    /// Identity recorded on refs this user updates.
    pub fn ident(&self) -> PersonIdent {
        PersonIdent::new(&self.username, format!("{}@localhost", self.username))
    }
}

/// Pushes need credentials; fetches stay anonymous.
fn requires_auth(request: &Request<Body>) -> bool {
    let uri = request.uri();
    if uri.path().ends_with("/git-receive-pack") {
        return true;
    }
    uri.query()
        .map(|query| {
            query
                .split('&')
                .any(|pair| pair.eq_ignore_ascii_case("service=git-receive-pack"))
        })
        .unwrap_or(false)
}

/// Returns the user name if the Authorization header matches.
fn check_basic_auth(request: &Request<Body>, auth: &AuthCredentials) -> Option<String> {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let credentials = header_value.strip_prefix("Basic ")?;
    let engine = base64::engine::general_purpose::STANDARD;
    let decoded = String::from_utf8(engine.decode(credentials).ok()?).ok()?;
    let (username, password) = decoded.split_once(':')?;
    (username == auth.username && password == auth.password).then(|| username.to_string())
}

/// Auth middleware - validates HTTP Basic Auth on push requests
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response<Body>, StatusCode> {
    // If auth is not enabled, allow request
    let Some(auth) = &state.auth else {
        return Ok(next.run(request).await);
    };
    if !requires_auth(&request) {
        return Ok(next.run(request).await);
    }

    match check_basic_auth(&request, auth) {
        Some(username) => {
            request.extensions_mut().insert(Principal { username });
            Ok(next.run(request).await)
        }
        // libgit2 cannot parse a challenge that carries a body
        None => Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::WWW_AUTHENTICATE, "Basic realm=\"cargit\"")
            .body(Body::empty())
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR),
    }
}
