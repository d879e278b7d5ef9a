use crate::{
    config::Config,
    envelope::Envelope,
    gateway::{CallOptions, Credentials, Gateway, Registration, SignupOutcome},
    session::{SessionStore, UserType},
    transport::{HttpTransport, Method, Response},
    Command,
};
use anyhow::{anyhow, Context as _, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use serde_json::Value;
use std::path::Path;
use tracing::debug;

pub type PortalGateway = Gateway<HttpTransport, Box<dyn SessionStore>>;

pub struct Context {
    pub gateway: PortalGateway,
    pub config: Config,
}

pub fn run(ctx: &Context, command: Command) -> Result<()> {
    match command {
        Command::Login {
            email,
            password,
            user_type,
        } => login(ctx, &email, password, &user_type),
        Command::Signup {
            email,
            name,
            password,
            user_type,
        } => signup(ctx, &email, &name, password, &user_type),
        Command::Logout => {
            ctx.gateway.logout()?;
            println!("Logged out");
            Ok(())
        }
        Command::Whoami => {
            whoami(ctx);
            Ok(())
        }
        Command::Call {
            method,
            path,
            body,
            headers,
            skip_auth,
        } => {
            let method = parse_method(&method)?;
            let mut options = CallOptions::new(method);
            if let Some(body) = body {
                options = options.body(parse_body(&body)?);
            }
            for header in &headers {
                let (name, value) = parse_header(header)?;
                options = options.header(&name, &value);
            }
            if skip_auth {
                options = options.skip_auth();
            }
            let response = ctx.gateway.call(&path, &options)?;
            print_response(&response);
            Ok(())
        }
        Command::Shell => run_shell(ctx),
    }
}

fn login(ctx: &Context, email: &str, password: Option<String>, user_type: &str) -> Result<()> {
    let user_type = parse_user_type(user_type)?;
    let password = require_password(password)?;
    let session = ctx.gateway.login(&Credentials {
        email: email.to_string(),
        password,
        user_type,
    })?;
    println!(
        "Logged in as {} ({})",
        session.display_name(),
        session.user_type.as_str()
    );
    Ok(())
}

fn signup(
    ctx: &Context,
    email: &str,
    name: &str,
    password: Option<String>,
    user_type: &str,
) -> Result<()> {
    let user_type = parse_user_type(user_type)?;
    let password = require_password(password)?;
    let registration = Registration {
        email: email.to_string(),
        password,
        user_type,
        name: name.to_string(),
    };
    match ctx.gateway.signup(&registration)? {
        SignupOutcome::SignedIn(session) => println!(
            "Account created; logged in as {} ({})",
            session.display_name(),
            session.user_type.as_str()
        ),
        SignupOutcome::Pending(envelope) => {
            let message = if envelope.message.is_empty() {
                "Account created; log in to continue"
            } else {
                envelope.message.as_str()
            };
            println!("{}", message);
        }
    }
    Ok(())
}

fn whoami(ctx: &Context) {
    match ctx.gateway.session() {
        Some(session) => {
            println!("{} ({})", session.display_name(), session.user_type.as_str());
            if let Ok(profile) = serde_json::to_string_pretty(&session.profile) {
                println!("{}", profile);
            }
        }
        None => println!("Not logged in"),
    }
}

/// Passwords are never read from the terminal, where they would be echoed
fn require_password(password: Option<String>) -> Result<String> {
    match password {
        Some(p) if !p.is_empty() => Ok(p),
        _ => Err(anyhow!(
            "No password given. Set PORTAL_PASSWORD or pass --password"
        )),
    }
}

pub fn run_shell(ctx: &Context) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    let history = ctx.config.history_path();
    if rl.load_history(&history).is_err() {
        debug!(path = %history.display(), "no shell history loaded");
    }

    println!(
        "portal shell on {} - type /help for commands, /exit to quit",
        ctx.config.api.base_url()
    );

    loop {
        let prompt = match ctx.gateway.session() {
            Some(session) => format!("{}> ", session.user_type.as_str()),
            None => "> ".to_string(),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line)?;

                if line.starts_with('/') {
                    match handle_command(ctx, line) {
                        Ok(true) => break,
                        Ok(false) => {}
                        Err(e) => eprintln!("Error: {}", e),
                    }
                    continue;
                }

                match parse_request_line(line) {
                    Ok((method, path, body)) => {
                        let mut options = CallOptions::new(method);
                        if let Some(body) = body {
                            options = options.body(body);
                        }
                        match ctx.gateway.call(&path, &options) {
                            Ok(response) => print_response(&response),
                            Err(e) => eprintln!("Error: {}", e),
                        }
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Input error: {}", e);
                break;
            }
        }
    }

    if let Err(e) = save_history(&mut rl, &history) {
        eprintln!("Warning: failed to save history to {}: {}", history.display(), e);
    }
    Ok(())
}

fn save_history(rl: &mut DefaultEditor, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    rl.save_history(path)?;
    Ok(())
}

/// Returns true when the shell should exit
fn handle_command(ctx: &Context, line: &str) -> Result<bool> {
    let parts = shell_words::split(line)?;
    let Some(cmd) = parts.first() else {
        return Ok(false);
    };
    match cmd.as_str() {
        "/exit" | "/quit" => return Ok(true),
        "/help" => {
            println!("Commands:");
            println!("  /exit                          - quit");
            println!("  /help                          - show commands");
            println!("  /whoami                        - show the logged-in user");
            println!("  /state                         - show auth state");
            println!("  /login <email> [student|teacher] - password from PORTAL_PASSWORD");
            println!("  /logout                        - end the session");
            println!("Requests:");
            println!("  <METHOD> <PATH> ['<json body>']");
            println!("  e.g. GET /api/v1/students/dashboard");
            println!("       POST /api/v1/quests/12/submit '{{\"answer\": 42}}'");
        }
        "/whoami" => whoami(ctx),
        "/state" => println!("{}", ctx.gateway.state().as_str()),
        "/login" => {
            let email = parts
                .get(1)
                .ok_or_else(|| anyhow!("Usage: /login <email> [student|teacher]"))?;
            let user_type = parse_user_type(parts.get(2).map(String::as_str).unwrap_or("student"))?;
            let password = require_password(std::env::var("PORTAL_PASSWORD").ok())?;
            let session = ctx.gateway.login(&Credentials {
                email: email.clone(),
                password,
                user_type,
            })?;
            println!(
                "Logged in as {} ({})",
                session.display_name(),
                session.user_type.as_str()
            );
        }
        "/logout" => {
            ctx.gateway.logout()?;
            println!("Logged out");
        }
        other => println!("Unknown command: {} (try /help)", other),
    }
    Ok(false)
}

/// Parse `METHOD PATH [BODY]`, honoring shell quoting
fn parse_request_line(line: &str) -> Result<(Method, String, Option<Value>)> {
    let parts = shell_words::split(line)?;
    match parts.as_slice() {
        [method, path] => Ok((parse_method(method)?, path.clone(), None)),
        [method, path, body] => Ok((parse_method(method)?, path.clone(), Some(parse_body(body)?))),
        _ => Err(anyhow!("Expected: <METHOD> <PATH> ['<json body>']")),
    }
}

fn parse_method(s: &str) -> Result<Method> {
    Method::from_str(s).ok_or_else(|| {
        anyhow!(
            "Invalid method: {}. Use: GET, POST, PUT, PATCH, DELETE",
            s
        )
    })
}

fn parse_user_type(s: &str) -> Result<UserType> {
    UserType::from_str(s)
        .ok_or_else(|| anyhow!("Invalid user type: {}. Use: student, teacher", s))
}

fn parse_body(s: &str) -> Result<Value> {
    serde_json::from_str(s).context("Request body must be valid JSON")
}

/// Parse a `Name: value` header
fn parse_header(s: &str) -> Result<(String, String)> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| anyhow!("Invalid header '{}', expected 'Name: value'", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(anyhow!("Invalid header '{}': empty name", s));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Status on stderr, body on stdout (pretty-printed when it is JSON)
fn print_response(response: &Response) {
    eprintln!("HTTP {}", response.status);
    if response.body.is_empty() {
        return;
    }
    match response.json::<Value>() {
        Ok(json) => match serde_json::to_string_pretty(&json) {
            Ok(pretty) => println!("{}", pretty),
            Err(_) => println!("{}", response.body),
        },
        Err(_) => println!("{}", response.body),
    }
    if !response.is_success() {
        let envelope = Envelope::from_response_lossy(response);
        if let Some(code) = envelope.error_code {
            eprintln!("error_code: {}", code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request_line() {
        let (method, path, body) = parse_request_line("get /api/v1/students/dashboard").unwrap();
        assert_eq!(method, Method::Get);
        assert_eq!(path, "/api/v1/students/dashboard");
        assert!(body.is_none());

        let (method, path, body) =
            parse_request_line(r#"POST /api/v1/raids/3/attack '{"dice": 6}'"#).unwrap();
        assert_eq!(method, Method::Post);
        assert_eq!(path, "/api/v1/raids/3/attack");
        assert_eq!(body, Some(json!({ "dice": 6 })));
    }

    #[test]
    fn test_parse_request_line_errors() {
        assert!(parse_request_line("GET").is_err());
        assert!(parse_request_line("FETCH /api").is_err());
        assert!(parse_request_line("POST /api '{bad json'").is_err());
        assert!(parse_request_line("POST /api '{}' extra").is_err());
        // Unbalanced quote
        assert!(parse_request_line("POST /api '{}").is_err());
    }

    #[test]
    fn test_parse_header() {
        assert_eq!(
            parse_header("X-Request-Id: abc:123").unwrap(),
            ("X-Request-Id".to_string(), "abc:123".to_string())
        );
        assert!(parse_header("no-colon").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn test_require_password() {
        assert_eq!(require_password(Some("hunter2".to_string())).unwrap(), "hunter2");
        let err = require_password(None).unwrap_err();
        assert!(err.to_string().contains("PORTAL_PASSWORD"));
        assert!(require_password(Some(String::new())).is_err());
    }

    #[test]
    fn test_history_round_trip() {
        use rustyline::history::History;
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("history");

        let mut rl = DefaultEditor::new().unwrap();
        rl.add_history_entry("GET /api/v1/students/dashboard").unwrap();
        save_history(&mut rl, &path).unwrap();

        let mut restored = DefaultEditor::new().unwrap();
        restored.load_history(&path).unwrap();
        assert_eq!(restored.history().len(), 1);
    }

    #[test]
    fn test_parse_user_type() {
        assert_eq!(parse_user_type("teacher").unwrap(), UserType::Teacher);
        let err = parse_user_type("admin").unwrap_err();
        assert!(err.to_string().contains("student, teacher"));
    }
}
