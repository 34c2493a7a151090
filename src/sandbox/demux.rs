use bollard::container::LogOutput;

/// Logical output channel of a sandboxed program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    /// Maps a frame of the container's multiplexed stream to the channel it belongs to
    pub fn of(frame: &LogOutput) -> Option<Channel> {
        match frame {
            LogOutput::StdOut { .. } | LogOutput::Console { .. } => Some(Channel::Stdout),
            LogOutput::StdErr { .. } => Some(Channel::Stderr),
            LogOutput::StdIn { .. } => None,
        }
    }
}

/// Separate, size-capped accumulators for stdout and stderr
#[derive(Debug)]
pub struct OutputBuffers {
    limit: usize,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    truncated: bool,
}

impl OutputBuffers {
    /// `limit` caps each channel independently, in bytes
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            stdout: Vec::new(),
            stderr: Vec::new(),
            truncated: false,
        }
    }

    /// Routes one frame to its channel
    pub fn accept(&mut self, frame: LogOutput) {
        if let Some(channel) = Channel::of(&frame) {
            self.push(channel, &frame.into_bytes());
        }
    }

    pub fn push(&mut self, channel: Channel, chunk: &[u8]) {
        let buffer = match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
        };

        let room = self.limit.saturating_sub(buffer.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        buffer.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Returns `(stdout, stderr)`, replacing invalid UTF-8
    pub fn into_strings(self) -> (String, String) {
        (
            String::from_utf8_lossy(&self.stdout).into_owned(),
            String::from_utf8_lossy(&self.stderr).into_owned(),
        )
    }
}
