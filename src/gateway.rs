//! Authenticated request gateway.
//!
//! Every call to the portal API goes through [`Gateway::call`]. The gateway
//! attaches the bearer token, notices expiry (any 401 on an authenticated
//! call), refreshes the token pair once, and retries the original request.
//!
//! Refreshes are serialized: the in-flight flag and the list of waiting
//! callers sit behind one mutex. The first caller to see a 401 performs the
//! refresh; everyone else who hits a 401 meanwhile parks on a one-shot channel
//! and is released with the same outcome.

use crate::config::ApiConfig;
use crate::envelope::Envelope;
use crate::error::{GatewayError, StoreError};
use crate::journal::Journal;
use crate::session::{Session, SessionRecord, SessionStore, UserType};
use crate::transport::{Method, Request, Response, Transport};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Called after an unrecoverable refresh failure has wiped the session
pub type SignOutHook = Box<dyn Fn() + Send + Sync>;

/// Base URL plus the paths the auth flow talks to
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub base_url: String,
    pub login_path: String,
    pub signup_path: String,
    pub logout_path: String,
    pub refresh_path: String,
}

impl From<&ApiConfig> for Endpoints {
    fn from(api: &ApiConfig) -> Self {
        Self {
            base_url: api.base_url().trim_end_matches('/').to_string(),
            login_path: api.login_path().to_string(),
            signup_path: api.signup_path().to_string(),
            logout_path: api.logout_path().to_string(),
            refresh_path: api.refresh_path().to_string(),
        }
    }
}

impl Endpoints {
    /// Absolute URLs pass through; anything else is joined to the base URL
    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else if endpoint.starts_with('/') {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}/{}", self.base_url, endpoint)
        }
    }

    /// Whether `endpoint` resolves to the API's own origin. Relative paths
    /// always do; absolute URLs must match the base URL's scheme and authority.
    pub fn is_same_origin(&self, endpoint: &str) -> bool {
        match origin(endpoint) {
            Some(target) => {
                origin(&self.base_url).is_some_and(|own| own.eq_ignore_ascii_case(target))
            }
            None => true,
        }
    }
}

/// `scheme://authority` prefix of an absolute http(s) URL
fn origin(url: &str) -> Option<&str> {
    let rest = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))?;
    let authority = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    Some(&url[..url.len() - rest.len() + authority])
}

/// Per-call options
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub method: Method,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    /// Send without credentials and never refresh. For login/signup, where a
    /// 401 means bad credentials rather than an expired token.
    pub skip_auth: bool,
}

impl CallOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            body: None,
            headers: Vec::new(),
            skip_auth: false,
        }
    }

    pub fn post(body: Value) -> Self {
        Self::new(Method::Post).body(body)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Where the gateway currently sits in the auth lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
    RefreshPending,
}

impl AuthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Authenticated => "authenticated",
            Self::RefreshPending => "refresh pending",
        }
    }
}

/// Login request body
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub user_type: UserType,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("user_type", &self.user_type)
            .finish()
    }
}

/// Signup request body
#[derive(Clone, Serialize)]
pub struct Registration {
    pub email: String,
    pub password: String,
    pub user_type: UserType,
    pub name: String,
}

/// Result of a signup: either the server signed us straight in, or it
/// accepted the registration without issuing tokens (e.g. pending approval)
#[derive(Debug)]
pub enum SignupOutcome {
    SignedIn(Session),
    Pending(Envelope<Value>),
}

/// `data` payload of a successful login/signup
#[derive(Deserialize)]
struct SessionGrant {
    access_token: String,
    refresh_token: String,
    user_type: UserType,
    #[serde(default)]
    user: Value,
}

/// `data` payload of a successful refresh
#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// What every caller parked on a refresh gets told. `Err` carries the reason.
type RefreshOutcome = Result<(), String>;

#[derive(Default)]
struct RefreshGate {
    in_flight: bool,
    waiters: Vec<Sender<RefreshOutcome>>,
}

/// Held by the refreshing caller. Settling (or unwinding) clears the flag and
/// releases every waiter exactly once.
struct InFlight<'a> {
    gate: &'a Mutex<RefreshGate>,
    settled: bool,
}

impl<'a> InFlight<'a> {
    fn new(gate: &'a Mutex<RefreshGate>) -> Self {
        Self {
            gate,
            settled: false,
        }
    }

    /// Returns how many waiters were released
    fn settle(mut self, outcome: RefreshOutcome) -> usize {
        self.settled = true;
        release(self.gate, outcome)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            release(self.gate, Err("token refresh aborted".to_string()));
        }
    }
}

fn release(gate: &Mutex<RefreshGate>, outcome: RefreshOutcome) -> usize {
    let waiters = {
        let mut gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
        gate.in_flight = false;
        std::mem::take(&mut gate.waiters)
    };
    let count = waiters.len();
    for waiter in waiters {
        // A waiter that gave up has dropped its receiver; nothing to do
        let _ = waiter.send(outcome.clone());
    }
    count
}

pub struct Gateway<T: Transport, S: SessionStore> {
    endpoints: Endpoints,
    transport: T,
    store: S,
    session: RwLock<Option<Session>>,
    gate: Mutex<RefreshGate>,
    journal: Option<Mutex<Journal>>,
    on_signed_out: Option<SignOutHook>,
}

impl<T: Transport, S: SessionStore> Gateway<T, S> {
    /// Create a gateway, rehydrating any session left in `store`.
    /// An incomplete or unreadable stored session is discarded.
    pub fn new(endpoints: Endpoints, transport: T, store: S) -> Result<Self, GatewayError> {
        let session = match store.read() {
            Ok(record) if record.is_empty() => None,
            Ok(record) => match record.into_session() {
                Some(session) => {
                    debug!(user_type = session.user_type.as_str(), "restored session");
                    Some(session)
                }
                None => {
                    warn!("discarding incomplete stored session");
                    store.clear()?;
                    None
                }
            },
            Err(StoreError::Json(e)) => {
                warn!("discarding unreadable stored session: {}", e);
                store.clear()?;
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            endpoints,
            transport,
            store,
            session: RwLock::new(session),
            gate: Mutex::new(RefreshGate::default()),
            journal: None,
            on_signed_out: None,
        })
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn on_signed_out(mut self, hook: SignOutHook) -> Self {
        self.on_signed_out = Some(hook);
        self
    }

    /// Snapshot of the current session
    pub fn session(&self) -> Option<Session> {
        self.read_session().clone()
    }

    pub fn state(&self) -> AuthState {
        if self.lock_gate().in_flight {
            AuthState::RefreshPending
        } else if self.read_session().is_some() {
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        }
    }

    /// Issue a call, transparently recovering from one access-token expiry.
    ///
    /// Non-401 responses (and every response to a `skip_auth` call) come back
    /// untouched. A 401 on an authenticated call triggers at most one refresh
    /// and one retry; a second 401 is returned as [`GatewayError::Unauthorized`].
    ///
    /// Absolute URLs outside the API's origin are sent without credentials
    /// and are treated like `skip_auth` calls.
    pub fn call(&self, endpoint: &str, options: &CallOptions) -> Result<Response, GatewayError> {
        let foreign = !self.endpoints.is_same_origin(endpoint);
        if foreign && !options.skip_auth {
            debug!(endpoint, "foreign origin, sending without credentials");
        }
        let authenticated = !options.skip_auth && !foreign;
        let token = if authenticated {
            self.access_token()
        } else {
            None
        };

        let response = self.send(endpoint, options, token.as_deref())?;
        if response.status != 401 || !authenticated {
            return Ok(response);
        }

        // Unauthenticated call; there is nothing to refresh
        let Some(sent) = token else {
            return Ok(response);
        };

        self.recover(&sent)?;

        let token = self.access_token();
        debug!(endpoint, "retrying after token refresh");
        let retried = self.send(endpoint, options, token.as_deref())?;
        if retried.status == 401 {
            return Err(GatewayError::Unauthorized(retried));
        }
        Ok(retried)
    }

    /// Log in and persist the resulting session
    pub fn login(&self, credentials: &Credentials) -> Result<Session, GatewayError> {
        let options = CallOptions::post(serde_json::to_value(credentials)?).skip_auth();
        let response = self.call(&self.endpoints.login_path, &options)?;
        if !response.is_success() {
            return Err(GatewayError::rejected(&response));
        }

        let envelope: Envelope<SessionGrant> = response.envelope()?;
        let grant = envelope.data.ok_or_else(|| GatewayError::Rejected {
            status: response.status,
            message: "login response carried no session".to_string(),
            error_code: envelope.error_code.clone(),
        })?;
        self.establish(grant)
    }

    /// Register a new account. Signs in when the server issues tokens.
    pub fn signup(&self, registration: &Registration) -> Result<SignupOutcome, GatewayError> {
        let options = CallOptions::post(serde_json::to_value(registration)?).skip_auth();
        let response = self.call(&self.endpoints.signup_path, &options)?;
        if !response.is_success() {
            return Err(GatewayError::rejected(&response));
        }

        let envelope: Envelope<Value> = response.envelope()?;
        let carries_tokens = envelope
            .data
            .as_ref()
            .is_some_and(|data| data.get("access_token").is_some());
        if !carries_tokens {
            return Ok(SignupOutcome::Pending(envelope));
        }

        let data = envelope.data.unwrap_or(Value::Null);
        let grant: SessionGrant = serde_json::from_value(data)?;
        Ok(SignupOutcome::SignedIn(self.establish(grant)?))
    }

    /// Voluntary logout. The server is told on a best-effort basis; the local
    /// session is always wiped.
    pub fn logout(&self) -> Result<(), GatewayError> {
        let session = self.session();
        if let Some(session) = &session {
            let options =
                CallOptions::post(json!({ "refresh_token": session.refresh_token }));
            // Sent directly: an expired token must not trigger a refresh here
            match self.send(
                &self.endpoints.logout_path,
                &options,
                Some(&session.access_token),
            ) {
                Ok(r) if !r.is_success() => debug!(status = r.status, "server-side logout failed"),
                Err(e) => debug!("server-side logout failed: {}", e),
                Ok(_) => {}
            }
        }

        self.clear_session()?;
        if session.is_some() {
            info!("logged out");
            self.record(|j| j.logout());
        }
        Ok(())
    }

    fn establish(&self, grant: SessionGrant) -> Result<Session, GatewayError> {
        let session = Session::new(
            grant.access_token,
            grant.refresh_token,
            grant.user_type,
            grant.user,
        );
        self.store.write(&SessionRecord::from(&session))?;
        *self.write_session() = Some(session.clone());

        info!(user_type = session.user_type.as_str(), "logged in");
        self.record(|j| j.login(session.user_type.as_str()));
        Ok(session)
    }

    /// Wait out or perform a refresh after `sent` was rejected with a 401.
    /// `Ok` means a fresh token is in place and the request may be retried.
    fn recover(&self, sent: &str) -> Result<(), GatewayError> {
        let waiter = {
            let mut gate = self.lock_gate();
            if gate.in_flight {
                let (tx, rx) = mpsc::channel();
                gate.waiters.push(tx);
                Some(rx)
            } else {
                match self.access_token() {
                    // A refresh finished after this request went out
                    Some(current) if current != sent => return Ok(()),
                    Some(_) => {
                        gate.in_flight = true;
                        None
                    }
                    None => {
                        return Err(GatewayError::SessionExpired(
                            "signed out while the request was in flight".to_string(),
                        ))
                    }
                }
            }
        };

        match waiter {
            Some(rx) => {
                debug!("waiting for in-flight token refresh");
                match rx.recv() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(reason)) => Err(GatewayError::SessionExpired(reason)),
                    Err(_) => Err(GatewayError::SessionExpired(
                        "token refresh abandoned".to_string(),
                    )),
                }
            }
            None => self.refresh_and_release(),
        }
    }

    /// Run the refresh procedure while holding the in-flight flag, then
    /// release every waiter with its outcome
    fn refresh_and_release(&self) -> Result<(), GatewayError> {
        let in_flight = InFlight::new(&self.gate);
        self.record(|j| j.refresh_start());

        match self.refresh() {
            Ok(rotated) => {
                let waiters = in_flight.settle(Ok(()));
                info!(rotated, waiters, "access token refreshed");
                self.record(|j| j.refresh_ok(rotated, waiters));
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                warn!("token refresh failed: {}", reason);
                // Wipe before releasing so no waiter retries with a dead token
                if let Err(e) = self.clear_session() {
                    warn!("failed to clear stored session: {}", e);
                }
                let waiters = in_flight.settle(Err(reason.clone()));
                self.record(|j| j.refresh_failed(&reason, waiters));
                self.record(|j| j.signed_out());
                if let Some(hook) = &self.on_signed_out {
                    hook();
                }
                Err(GatewayError::SessionExpired(reason))
            }
        }
    }

    /// Exchange the refresh token for a new access token and persist the
    /// result. Returns whether the refresh token was rotated.
    fn refresh(&self) -> Result<bool, GatewayError> {
        let refresh_token = self
            .read_session()
            .as_ref()
            .map(|s| s.refresh_token.clone())
            .ok_or_else(|| GatewayError::SessionExpired("no refresh token".to_string()))?;

        let options = CallOptions::post(json!({ "refresh_token": refresh_token })).skip_auth();
        let response = self.send(&self.endpoints.refresh_path, &options, None)?;
        if !response.is_success() {
            return Err(GatewayError::SessionExpired(format!(
                "refresh rejected with HTTP {}",
                response.status
            )));
        }

        let envelope: Envelope<TokenGrant> = response.envelope()?;
        let grant = envelope.data.ok_or_else(|| {
            GatewayError::SessionExpired("refresh response carried no tokens".to_string())
        })?;
        let rotated = grant.refresh_token.is_some();

        let snapshot = {
            let mut session = self.write_session();
            let session = session.as_mut().ok_or_else(|| {
                GatewayError::SessionExpired("signed out during refresh".to_string())
            })?;
            session.rotate(grant.access_token, grant.refresh_token);
            session.clone()
        };
        self.store.write(&SessionRecord::from(&snapshot))?;
        Ok(rotated)
    }

    fn send(
        &self,
        endpoint: &str,
        options: &CallOptions,
        token: Option<&str>,
    ) -> Result<Response, GatewayError> {
        let request = self.build_request(endpoint, options, token)?;
        let method = request.method.as_str();
        debug!(method, url = %request.url, authenticated = token.is_some(), "sending request");
        self.record(|j| j.request(method, &request.url, token.is_some()));

        match self.transport.send(&request) {
            Ok(response) => {
                debug!(method, url = %request.url, status = response.status, "received response");
                self.record(|j| j.response(method, &request.url, response.status));
                Ok(response)
            }
            Err(e) => {
                self.record(|j| j.transport_error(method, &request.url, &e.0));
                Err(e.into())
            }
        }
    }

    fn build_request(
        &self,
        endpoint: &str,
        options: &CallOptions,
        token: Option<&str>,
    ) -> Result<Request, GatewayError> {
        let mut headers: Vec<(String, String)> = options
            .headers
            .iter()
            .filter(|(name, _)| {
                let ours = (token.is_some() && name.eq_ignore_ascii_case("Authorization"))
                    || (options.body.is_some() && name.eq_ignore_ascii_case("Content-Type"));
                !ours
            })
            .cloned()
            .collect();

        let body = match &options.body {
            Some(body) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                Some(serde_json::to_string(body)?)
            }
            None => None,
        };

        if let Some(token) = token {
            headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
        }

        Ok(Request {
            method: options.method,
            url: self.endpoints.url(endpoint),
            headers,
            body,
        })
    }

    fn clear_session(&self) -> Result<(), GatewayError> {
        *self.write_session() = None;
        self.store.clear()?;
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.read_session().as_ref().map(|s| s.access_token.clone())
    }

    fn read_session(&self) -> std::sync::RwLockReadGuard<'_, Option<Session>> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_session(&self) -> std::sync::RwLockWriteGuard<'_, Option<Session>> {
        self.session.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_gate(&self) -> MutexGuard<'_, RefreshGate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, f: impl FnOnce(&mut Journal) -> anyhow::Result<()>) {
        if let Some(journal) = &self.journal {
            let mut journal = journal.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = f(&mut journal) {
                warn!("failed to write journal: {}", e);
            }
        }
    }
}
