//! Local notification sink.

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::io::Write;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Notification permission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
  Granted,
  Denied,
  /// Not decided yet; requesting will ask the user
  Default,
}

/// Something that can raise a local notification.
pub trait NotificationSink: Send + Sync + 'static {
  fn permission(&self) -> Permission;

  /// Ask for permission. Resolves to the resulting state.
  fn request_permission(&self) -> impl Future<Output = Permission> + Send;

  fn show(&self, title: &str, body: &str) -> Result<()>;
}

/// Writes notifications to stdout. Permission is asked interactively on stdin.
pub struct TerminalSink {
  permission: Mutex<Permission>,
}

impl TerminalSink {
  pub fn new(permission: Permission) -> Self {
    Self {
      permission: Mutex::new(permission),
    }
  }

  fn set_permission(&self, permission: Permission) {
    if let Ok(mut guard) = self.permission.lock() {
      *guard = permission;
    }
  }
}

impl NotificationSink for TerminalSink {
  fn permission(&self) -> Permission {
    self
      .permission
      .lock()
      .map(|p| *p)
      .unwrap_or(Permission::Denied)
  }

  async fn request_permission(&self) -> Permission {
    let current = self.permission();
    if current != Permission::Default {
      return current;
    }

    print!("Allow office-events to show notifications? [y/N] ");
    let _ = std::io::stdout().flush();

    let mut line = String::new();
    let mut stdin = BufReader::new(tokio::io::stdin());
    let granted = match stdin.read_line(&mut line).await {
      Ok(_) => matches!(line.trim().to_lowercase().as_str(), "y" | "yes"),
      Err(e) => {
        tracing::warn!(error = %e, "failed to read permission answer");
        false
      }
    };

    let permission = if granted {
      Permission::Granted
    } else {
      Permission::Denied
    };
    self.set_permission(permission);
    permission
  }

  fn show(&self, title: &str, body: &str) -> Result<()> {
    if self.permission() != Permission::Granted {
      return Err(eyre!("Notification permission not granted"));
    }
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "\u{1f514} {}: {}", title, body)
      .map_err(|e| eyre!("Failed to write notification: {}", e))?;
    Ok(())
  }
}
