//! Shipping workload scripts to the DUT console.
//!
//! The console is line oriented and echoes what it receives, so the script is
//! base64 encoded and written into a heredoc. The wrapper prints `start` and
//! `end` around the workload; those two lines are the only signal the host
//! gets about where the workload begins and ends on the DUT.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::time::Duration;
use tokio::time::{timeout, Instant};

use super::link::SharedLink;
use crate::{error::Result, utils::sleep::pace};

/// Interrupt (Ctrl-C) followed by a newline.
pub const CANCEL_COMMAND: &str = "\x03\n";
pub const RESTORE_POWER_COMMAND: &str = "ectool chargecontrol normal\n";
const HEREDOC_DELIMITER: &str = "EOF";

/// Wrap a workload body into the measurement script.
pub fn render_script(body: &str) -> String {
    format!(
        "#!/bin/bash -e
function workload () {{
  {body}
}}
ectool chargecontrol idle
sleep 3
echo \"start\"
workload 1> ./test_out.log 2> ./test_err.log
echo \"end\"
sleep 3
echo \"stop\"
ectool chargecontrol normal\n"
    )
}

pub fn encode_payload(body: &str) -> String {
    STANDARD.encode(render_script(body))
}

/// Remote file holding the script of one configuration slot.
pub fn remote_script_path(slot: usize) -> String {
    format!("./workload_{slot}.sh")
}

pub struct ScriptTransport {
    link: SharedLink,
    pacing: Duration,
}

impl ScriptTransport {
    pub fn new(link: SharedLink, pacing: Duration) -> Self {
        Self { link, pacing }
    }

    async fn send(&self, command: &str) -> Result<()> {
        self.link.write(command.as_bytes()).await?;
        pace(self.pacing).await;
        Ok(())
    }

    /// Write the wrapped script to `remote_path` on the DUT.
    pub async fn upload(&self, remote_path: &str, body: &str) -> Result<()> {
        log::info!("Uploading workload to {remote_path}");
        self.send(&format!("cat > {remote_path} << {HEREDOC_DELIMITER}\n"))
            .await?;
        self.send(&format!("{}\n", encode_payload(body))).await?;
        self.send(&format!("{HEREDOC_DELIMITER}\n")).await
    }

    pub async fn execute(&self, remote_path: &str) -> Result<()> {
        log::info!("Executing {remote_path}");
        self.send(&format!("base64 -d {remote_path} | bash\n")).await
    }

    pub async fn cancel(&self) -> Result<()> {
        self.send(CANCEL_COMMAND).await
    }

    pub async fn restore_power(&self) -> Result<()> {
        self.send(RESTORE_POWER_COMMAND).await
    }

    /// Swallow console output until it has been quiet for `quiet`, or until
    /// `limit` elapsed. Returns what was discarded.
    pub async fn drain_echo(&self, quiet: Duration, limit: Duration) -> Result<String> {
        let deadline = Instant::now() + limit;
        let mut drained = String::new();
        while Instant::now() < deadline {
            match timeout(quiet, self.link.read()).await {
                Ok(chunk) => drained.push_str(&chunk?),
                Err(_) => break,
            }
        }
        if !drained.is_empty() {
            log::debug!("Discarded {} bytes of console echo", drained.len());
        }
        Ok(drained)
    }
}
