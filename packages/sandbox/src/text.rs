// ABOUTME: Text rules around sandbox execution: input sanitizing, output cleanup and message splitting
// ABOUTME: Also holds the destructive-command blocklist checked before anything reaches a sandbox

/// Largest single message the chat transport accepts, in characters
pub const MAX_MESSAGE_LEN: usize = 2000;

/// Characters kept when an execution result has to be cut down
pub const TRUNCATED_LEN: usize = MAX_MESSAGE_LEN - 100;

pub const TRUNCATION_MARKER: &str = "\n\n... (output truncated)";

/// Separator placed between stdout and a non-empty stderr
pub const STDERR_MARKER: &str = "\nSTDERR:\n";

/// Substrings that mark a command as destructive (lowercase)
pub const DANGEROUS_PATTERNS: &[&str] = &[
    "rm -rf /",
    ":(){ :|:& };:",
    "dd if=/dev/zero",
    "mkfs.",
    "fdisk",
    "cfdisk",
    "parted",
    "halt",
    "poweroff",
    "reboot",
    "shutdown",
];

/// Returns the matched pattern when the trimmed, lowercased command contains one
pub fn dangerous_pattern(command: &str) -> Option<&'static str> {
    let lowered = command.trim().to_lowercase();
    DANGEROUS_PATTERNS
        .iter()
        .copied()
        .find(|pattern| lowered.contains(pattern))
}

/// Prepare chat text for injection into a shell
pub fn sanitize_input(message: &str) -> String {
    message
        .trim()
        .replace("```", "")
        .replace('`', "'")
        .replace("\r\n", "\n")
        .replace('\r', "\n")
}

/// Strip blank lines and surrounding whitespace, then cap to one chat message
pub fn clean_output(output: &str) -> String {
    let joined = output
        .trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if joined.chars().count() <= MAX_MESSAGE_LEN {
        return joined;
    }

    let mut truncated: String = joined.chars().take(TRUNCATED_LEN).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

/// Join separately captured streams
pub fn merge_output(stdout: &str, stderr: &str) -> String {
    if stderr.is_empty() {
        stdout.to_string()
    } else {
        format!("{}{}{}", stdout, STDERR_MARKER, stderr)
    }
}

/// Single-quote a string for `/bin/sh`
pub fn escape_shell(s: &str) -> String {
    format!("'{}'", s.replace('\'', r#"'"'"'"#))
}

/// Split `content` into chunks of at most `max_len` characters.
/// A chunk ends after the last newline inside the window when that newline lies past half the window.
pub fn split_message(content: &str, max_len: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if max_len == 0 {
        return chunks;
    }

    let mut rest = content;
    while !rest.is_empty() {
        // byte offset just past the max_len-th character
        let window_end = rest
            .char_indices()
            .nth(max_len)
            .map(|(idx, _)| idx)
            .unwrap_or(rest.len());

        let mut end = window_end;
        if window_end < rest.len() {
            let window = &rest[..window_end];
            if let Some(newline) = window.rfind('\n') {
                if window[..newline].chars().count() > max_len / 2 {
                    end = newline + 1;
                }
            }
        }

        chunks.push(rest[..end].to_string());
        rest = &rest[end..];
    }

    chunks
}
