//! Interactive dashboard
//!
//! A single task reads commands from stdin and changes from the feed, so the
//! dashboard never sees two operations at once.

use anyhow::Result;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use crate::backend::{Backend, LocalBackend};
use crate::dashboard::Dashboard;
use crate::error::DashboardError;
use crate::model::{Bookmark, Provider};
use crate::reconciler::Outcome;

const HELP: &str = "\
commands:
  login <github|google> <subject>   sign in
  ls                                list bookmarks
  add <url> <title...>              add a bookmark
  edit <id> <url> <title...>        edit a bookmark
  rm <id>                           delete a bookmark
  refresh                           reload from the backend
  logout                            sign out
  help                              show this help
  quit                              exit";

#[derive(Debug, PartialEq, Eq)]
enum Cmd<'a> {
    Login(Provider, &'a str),
    List,
    Add { url: &'a str, title: &'a str },
    Edit { id: &'a str, url: &'a str, title: &'a str },
    Remove(&'a str),
    Refresh,
    Logout,
    Help,
    Quit,
    Empty,
}

fn split_word(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

fn parse(line: &str) -> Result<Cmd<'_>, String> {
    let (cmd, rest) = split_word(line.trim());

    let cmd = match cmd {
        "" => Cmd::Empty,
        "ls" | "list" => Cmd::List,
        "refresh" => Cmd::Refresh,
        "logout" => Cmd::Logout,
        "help" | "?" => Cmd::Help,
        "quit" | "exit" => Cmd::Quit,
        "login" => {
            let (provider, subject) = split_word(rest);
            let provider = Provider::from_str(provider)
                .ok_or_else(|| format!("unknown provider '{}'", provider))?;
            if subject.is_empty() {
                return Err("usage: login <github|google> <subject>".to_string());
            }
            Cmd::Login(provider, subject)
        }
        "add" => {
            let (url, title) = split_word(rest);
            if url.is_empty() {
                return Err("usage: add <url> <title...>".to_string());
            }
            Cmd::Add { url, title }
        }
        "edit" => {
            let (id, rest) = split_word(rest);
            let (url, title) = split_word(rest);
            if id.is_empty() || url.is_empty() {
                return Err("usage: edit <id> <url> <title...>".to_string());
            }
            Cmd::Edit { id, url, title }
        }
        "rm" | "delete" => {
            if rest.is_empty() {
                return Err("usage: rm <id>".to_string());
            }
            Cmd::Remove(rest)
        }
        other => return Err(format!("unknown command '{}', try 'help'", other)),
    };
    Ok(cmd)
}

/// Accepts a full id or any prefix that matches exactly one bookmark.
fn resolve_id(bookmarks: &[Bookmark], prefix: &str) -> Result<String, String> {
    let mut matches = bookmarks.iter().filter(|b| b.id.starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(b), None) => Ok(b.id.clone()),
        (Some(_), Some(_)) => Err(format!("'{}' is ambiguous", prefix)),
        (None, _) => Err(format!("no bookmark matches '{}'", prefix)),
    }
}

fn render(bookmarks: &[Bookmark]) {
    if bookmarks.is_empty() {
        println!("No bookmarks yet. Add one with: add <url> <title>");
        return;
    }
    for b in bookmarks {
        let short: String = b.id.chars().take(8).collect();
        println!("{}  {:<32}  {}", short, b.title, b.url);
    }
}

fn prompt(signed_in: bool) {
    print!("{}> ", if signed_in { "bookmarks" } else { "(signed out)" });
    let _ = std::io::stdout().flush();
}

enum Input {
    Line(Option<String>),
    Change(Result<Outcome, DashboardError>),
    Interrupt,
}

async fn next_change(dashboard: &mut Option<Dashboard<LocalBackend>>) -> Result<Outcome, DashboardError> {
    match dashboard {
        Some(dashboard) => dashboard.next_event().await,
        None => std::future::pending().await,
    }
}

pub async fn run(backend: LocalBackend) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut dashboard = match Dashboard::open(backend.clone()).await {
        Ok(dashboard) => Some(dashboard),
        Err(DashboardError::AuthRequired) => None,
        Err(e) => return Err(e.into()),
    };

    println!("{}", HELP);
    if let Some(dashboard) = &dashboard {
        render(dashboard.bookmarks());
    }

    loop {
        prompt(dashboard.is_some());

        let input = tokio::select! {
            line = lines.next_line() => Input::Line(line?),
            change = next_change(&mut dashboard) => Input::Change(change),
            _ = signal::ctrl_c() => Input::Interrupt,
        };

        let line = match input {
            Input::Line(Some(line)) => line,
            Input::Line(None) | Input::Interrupt => break,
            Input::Change(result) => {
                println!();
                handle_change(&mut dashboard, result).await;
                continue;
            }
        };

        // a lag reload cut short by this line must finish before the command
        if let Some(current) = dashboard.as_mut().filter(|d| d.is_stale()) {
            if let Err(e) = current.refresh().await {
                println!("error: {}", crate::unpack_error(&e));
            }
        }

        match parse(&line) {
            Ok(Cmd::Quit) => break,
            Ok(cmd) => {
                if let Err(e) = execute(&backend, &mut dashboard, cmd).await {
                    println!("error: {}", crate::unpack_error(&e));
                }
            }
            Err(usage) => println!("{}", usage),
        }
    }

    if let Some(dashboard) = dashboard {
        dashboard.close();
    }
    println!("bye");
    Ok(())
}

async fn handle_change(dashboard: &mut Option<Dashboard<LocalBackend>>, result: Result<Outcome, DashboardError>) {
    let Some(current) = dashboard.as_mut() else {
        return;
    };

    match result {
        Ok(outcome) if outcome.changed() => {
            // echoes of our own writes arrive in a burst; draw the settled list
            if let Err(e) = current.pump().await {
                println!("error: {}", crate::unpack_error(&e));
            }
            render(current.bookmarks());
        }
        Ok(_) => {}
        Err(DashboardError::StreamDisconnected) => {
            tracing::warn!("change stream disconnected, reconnecting");
            match current.reconnect().await {
                Ok(()) => render(current.bookmarks()),
                Err(e) => println!("error: {}", crate::unpack_error(&e)),
            }
        }
        Err(e) => println!("error: {}", crate::unpack_error(&e)),
    }
}

async fn execute(
    backend: &LocalBackend,
    dashboard: &mut Option<Dashboard<LocalBackend>>,
    cmd: Cmd<'_>,
) -> Result<(), DashboardError> {
    if let Cmd::Login(provider, subject) = cmd {
        if let Some(current) = dashboard.as_ref() {
            println!(
                "already signed in as {}, logout first",
                current.session().user().subject
            );
            return Ok(());
        }
        backend
            .complete_sign_in(provider, subject)
            .await
            .map_err(DashboardError::fetch)?;
        let opened = Dashboard::open(backend.clone()).await?;
        println!("signed in as {}", opened.session().user().subject);
        render(opened.bookmarks());
        *dashboard = Some(opened);
        return Ok(());
    }

    if matches!(cmd, Cmd::Help) {
        println!("{}", HELP);
        return Ok(());
    }
    if matches!(cmd, Cmd::Empty) {
        return Ok(());
    }

    let Some(current) = dashboard.as_mut() else {
        if let Ok(url) = backend.sign_in_with_oauth(Provider::Github).await {
            println!("sign in at {}", url);
        }
        return Err(DashboardError::AuthRequired);
    };

    match cmd {
        Cmd::List => render(current.bookmarks()),
        Cmd::Refresh => {
            current.refresh().await?;
            render(current.bookmarks());
        }
        Cmd::Add { url, title } => {
            current.save(None, title, url).await?;
            render(current.bookmarks());
        }
        Cmd::Edit { id, url, title } => {
            let id = resolve_id(current.bookmarks(), id).map_err(DashboardError::Validation)?;
            current.save(Some(&id), title, url).await?;
            render(current.bookmarks());
        }
        Cmd::Remove(id) => {
            let id = resolve_id(current.bookmarks(), id).map_err(DashboardError::Validation)?;
            current.delete(&id).await?;
            render(current.bookmarks());
        }
        Cmd::Logout => {
            if let Some(closing) = dashboard.take() {
                closing.sign_out().await?;
                println!("signed out");
            }
        }
        Cmd::Login(..) | Cmd::Help | Cmd::Quit | Cmd::Empty => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn bookmark(id: &str) -> Bookmark {
        Bookmark {
            id: id.to_string(),
            title: "t".to_string(),
            url: "u".to_string(),
            user_id: "owner".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse("  ls "), Ok(Cmd::List));
        assert_eq!(parse(""), Ok(Cmd::Empty));
        assert_eq!(
            parse("login github octocat"),
            Ok(Cmd::Login(Provider::Github, "octocat"))
        );
        assert_eq!(
            parse("add https://rust-lang.org The Rust   site"),
            Ok(Cmd::Add {
                url: "https://rust-lang.org",
                title: "The Rust   site"
            })
        );
        assert_eq!(
            parse("edit 3fa2 https://x.example New title"),
            Ok(Cmd::Edit {
                id: "3fa2",
                url: "https://x.example",
                title: "New title"
            })
        );
        assert_eq!(parse("rm 3fa2"), Ok(Cmd::Remove("3fa2")));
    }

    #[test]
    fn test_parse_rejects_incomplete_commands() {
        assert!(parse("add").is_err());
        assert!(parse("edit 3fa2").is_err());
        assert!(parse("rm").is_err());
        assert!(parse("login gitlab me").is_err());
        assert!(parse("login github").is_err());
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn test_add_without_title_parses_and_is_left_to_validation() {
        assert_eq!(
            parse("add https://rust-lang.org"),
            Ok(Cmd::Add {
                url: "https://rust-lang.org",
                title: ""
            })
        );
    }

    #[test]
    fn test_resolve_id_by_prefix() {
        let list = vec![bookmark("abc123"), bookmark("abd456"), bookmark("ffff")];
        assert_eq!(resolve_id(&list, "abc"), Ok("abc123".to_string()));
        assert_eq!(resolve_id(&list, "ffff"), Ok("ffff".to_string()));
        assert!(resolve_id(&list, "ab").is_err());
        assert!(resolve_id(&list, "zz").is_err());
    }
}
