use crate::models::Channel;

/// Warnings printed by shells started without a controlling terminal.
pub const DEFAULT_NOISE_FILTERS: &[&str] = &[
    "cannot set terminal process group",
    "no job control in this shell",
    "Inappropriate ioctl for device",
    "stdin: is not a tty",
];

/// Longest line emitted before the carry is cut, in bytes.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Turns chunked byte arrivals into complete lines, one carry buffer per channel.
///
/// Lines are split on `\n` only and decoded lossily once complete, so a
/// multi-byte character split across chunks is reassembled before decoding.
/// A carry that grows past `max_line_bytes` without a newline is emitted in
/// pieces of at most that size, cut on a character boundary where possible.
#[derive(Debug)]
pub struct LineSplitter {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    status: Vec<u8>,
    noise_filters: Vec<String>,
    max_line_bytes: usize,
}

impl LineSplitter {
    pub fn new(noise_filters: Vec<String>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: Vec::new(),
            status: Vec::new(),
            noise_filters,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn with_max_line_bytes(mut self, max_line_bytes: usize) -> Self {
        self.max_line_bytes = max_line_bytes.max(1);
        self
    }

    #[cfg(test)]
    pub fn with_default_filters() -> Self {
        Self::new(DEFAULT_NOISE_FILTERS.iter().map(|s| s.to_string()).collect())
    }

    pub fn feed(&mut self, channel: Channel, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = bytes;

        loop {
            let newline = rest.iter().position(|&b| b == b'\n');
            let (segment, remainder) = match newline {
                Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                None => (rest, &[][..]),
            };
            self.carry_mut(channel).extend_from_slice(segment);
            self.cut_oversized(channel, &mut lines);

            if newline.is_none() {
                break;
            }
            let raw = std::mem::take(self.carry_mut(channel));
            self.push_line(raw, &mut lines);
            rest = remainder;
        }
        lines
    }

    /// Emits whatever is left in the channel's carry buffer.
    pub fn flush(&mut self, channel: Channel) -> Option<String> {
        let raw = std::mem::take(self.carry_mut(channel));
        if raw.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        if self.is_noise(&line) {
            return None;
        }
        Some(line)
    }

    /// Emits full-size pieces while the carry is over the limit. A carry of
    /// exactly the limit waits, so a newline right after it adds no empty line.
    fn cut_oversized(&mut self, channel: Channel, lines: &mut Vec<String>) {
        let max = self.max_line_bytes;
        while self.carry_mut(channel).len() > max {
            let carry = self.carry_mut(channel);
            let cut = char_boundary(carry, max);
            let rest = carry.split_off(cut);
            let raw = std::mem::replace(carry, rest);
            self.push_line(raw, lines);
        }
    }

    fn push_line(&self, raw: Vec<u8>, lines: &mut Vec<String>) {
        let line = String::from_utf8_lossy(&raw).into_owned();
        if !self.is_noise(&line) {
            lines.push(line);
        }
    }

    fn carry_mut(&mut self, channel: Channel) -> &mut Vec<u8> {
        match channel {
            Channel::Stdout => &mut self.stdout,
            Channel::Stderr => &mut self.stderr,
            Channel::Status => &mut self.status,
        }
    }

    fn is_noise(&self, line: &str) -> bool {
        self.noise_filters
            .iter()
            .any(|pattern| !pattern.is_empty() && line.contains(pattern.as_str()))
    }
}

/// Backs `at` off continuation bytes so a UTF-8 sequence is not split.
fn char_boundary(bytes: &[u8], at: usize) -> usize {
    let mut cut = at;
    while cut > 0 && at - cut < 4 && bytes.get(cut).is_some_and(|b| b & 0xC0 == 0x80) {
        cut -= 1;
    }
    if cut == 0 || at - cut >= 4 { at } else { cut }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splitter: &mut LineSplitter, channel: Channel, chunks: &[&[u8]]) -> Vec<String> {
        let mut lines = Vec::new();
        for chunk in chunks {
            lines.extend(splitter.feed(channel, chunk));
        }
        lines.extend(splitter.flush(channel));
        lines
    }

    #[test]
    fn splits_lines_across_chunks() {
        let mut splitter = LineSplitter::new(Vec::new());
        let lines = collect(
            &mut splitter,
            Channel::Stdout,
            &[b"hel", b"lo\nwor", b"ld\n", b"tail"],
        );
        assert_eq!(lines, vec!["hello", "world", "tail"]);
    }

    #[test]
    fn keeps_empty_lines() {
        let mut splitter = LineSplitter::new(Vec::new());
        let lines = collect(&mut splitter, Channel::Stdout, &[b"a\n\n\nb\n"]);
        assert_eq!(lines, vec!["a", "", "", "b"]);
    }

    #[test]
    fn flush_on_empty_carry_yields_nothing() {
        let mut splitter = LineSplitter::new(Vec::new());
        assert_eq!(splitter.feed(Channel::Stdout, b"done\n"), vec!["done"]);
        assert_eq!(splitter.flush(Channel::Stdout), None);
    }

    #[test]
    fn reassembles_multibyte_characters() {
        let text = "héllo ✅\n".as_bytes();
        let mut splitter = LineSplitter::new(Vec::new());
        let chunks: Vec<&[u8]> = text.chunks(1).collect();
        let lines = collect(&mut splitter, Channel::Stdout, &chunks);
        assert_eq!(lines, vec!["héllo ✅"]);
    }

    #[test]
    fn channels_do_not_share_carry() {
        let mut splitter = LineSplitter::new(Vec::new());
        assert!(splitter.feed(Channel::Stdout, b"out-").is_empty());
        assert!(splitter.feed(Channel::Stderr, b"err-").is_empty());
        assert_eq!(splitter.feed(Channel::Stdout, b"1\n"), vec!["out-1"]);
        assert_eq!(splitter.feed(Channel::Stderr, b"2\n"), vec!["err-2"]);
    }

    #[test]
    fn drops_noisy_shell_warnings() {
        let mut splitter = LineSplitter::with_default_filters();
        let lines = collect(
            &mut splitter,
            Channel::Stderr,
            &[
                b"bash: cannot set terminal process group (-1): Inappropriate ioctl for device\n",
                b"bash: no job control in this shell\n",
                b"real error\n",
            ],
        );
        assert_eq!(lines, vec!["real error"]);
    }

    #[test]
    fn any_chunking_reproduces_the_input_lines() {
        let input: Vec<u8> = b"alpha\n\nbeta gamma\n\xff\xfe raw\ndelta\n\nlast".to_vec();
        let expected: Vec<String> = String::from_utf8_lossy(&input)
            .split('\n')
            .map(str::to_string)
            .collect();

        for size in 1..=input.len() {
            let mut splitter = LineSplitter::new(Vec::new());
            let chunks: Vec<&[u8]> = input.chunks(size).collect();
            let lines = collect(&mut splitter, Channel::Stdout, &chunks);
            assert_eq!(lines, expected, "chunk size {size}");
        }
    }

    #[test]
    fn trailing_newline_leaves_no_remainder() {
        let input = b"one\ntwo\n";
        for size in 1..=input.len() {
            let mut splitter = LineSplitter::new(Vec::new());
            let chunks: Vec<&[u8]> = input.chunks(size).collect();
            let lines = collect(&mut splitter, Channel::Stdout, &chunks);
            assert_eq!(lines, vec!["one", "two"], "chunk size {size}");
        }
    }

    #[test]
    fn overlong_line_is_emitted_in_bounded_pieces() {
        let input = vec![b'a'; 10 * 1024 + 7];
        let mut splitter = LineSplitter::new(Vec::new()).with_max_line_bytes(1024);

        let mut lines = Vec::new();
        for chunk in input.chunks(300) {
            lines.extend(splitter.feed(Channel::Stdout, chunk));
            assert!(splitter.stdout.len() <= 1024);
        }
        lines.extend(splitter.flush(Channel::Stdout));

        assert_eq!(lines.len(), 11);
        assert!(lines.iter().all(|line| line.len() <= 1024));
        assert_eq!(lines.concat().as_bytes(), input.as_slice());
    }

    #[test]
    fn line_of_exactly_the_limit_stays_whole() {
        let mut splitter = LineSplitter::new(Vec::new()).with_max_line_bytes(4);
        let lines = collect(&mut splitter, Channel::Stdout, &[b"abcd\nabcdefghij\n"]);
        assert_eq!(lines, vec!["abcd", "abcd", "efgh", "ij"]);
    }

    #[test]
    fn cut_does_not_split_a_character() {
        let mut splitter = LineSplitter::new(Vec::new()).with_max_line_bytes(4);
        // "ab" then a three-byte character straddling the limit.
        let lines = collect(&mut splitter, Channel::Stdout, &["ab✅c".as_bytes()]);
        assert_eq!(lines, vec!["ab", "✅c"]);
    }
}
