use crate::features::Features;
use crate::rule::{Action, Rule};

const MAX_COMMENT_LEN: usize = 256;

/// Makes a comment safe to embed in a double quoted restore argument.
pub fn escape_comment(comment: &str) -> String {
    let cleaned: String = comment
        .chars()
        .filter(|c| *c != '\n' && *c != '\r')
        .map(|c| if c == '"' { '\'' } else { c })
        .collect();
    if cleaned.len() <= MAX_COMMENT_LEN {
        return cleaned;
    }
    let mut end = MAX_COMMENT_LEN;
    while !cleaned.is_char_boundary(end) {
        end -= 1;
    }
    cleaned[..end].to_string()
}

pub fn comment_fragment(text: &str) -> String {
    format!("-m comment --comment \"{text}\"")
}

pub fn render_action(action: &Action, features: &Features) -> String {
    let fully_random = if features.fully_random { " --random-fully" } else { "" };
    match action {
        Action::Accept => "--jump ACCEPT".to_string(),
        Action::Drop => "--jump DROP".to_string(),
        Action::Reject => "--jump REJECT".to_string(),
        Action::Return => "--jump RETURN".to_string(),
        Action::Jump(target) => format!("--jump {target}"),
        Action::Goto(target) => format!("--goto {target}"),
        Action::Log { prefix } => format!("--jump LOG --log-prefix \"{}: \" --log-level 5", escape_comment(prefix)),
        Action::SetMark { mark, mask } => format!("--jump MARK --set-mark {mark:#x}/{mask:#x}"),
        Action::ClearMark { mask } => format!("--jump MARK --set-mark 0/{mask:#x}"),
        Action::Masquerade => format!("--jump MASQUERADE{fully_random}"),
        Action::Snat { to } => format!("--jump SNAT --to-source {to}{fully_random}"),
        Action::NoTrack => "--jump NOTRACK".to_string(),
    }
}

/// Everything of a rule except the hash tag: user comments, matches, action.
pub fn render_body(rule: &Rule, features: &Features) -> String {
    let mut parts: Vec<String> = rule
        .comments
        .iter()
        .map(|c| comment_fragment(&escape_comment(c)))
        .collect();
    if !rule.match_criteria.is_empty() {
        parts.push(rule.match_criteria.render());
    }
    parts.push(render_action(&rule.action, features));
    parts.join(" ")
}

/// Rule text as programmed, tagged with its commitment hash.
pub fn render_tagged(rule: &Rule, hash_prefix: &str, hash: &str, features: &Features) -> String {
    format!(
        "{} {}",
        comment_fragment(&format!("{hash_prefix}{hash}")),
        render_body(rule, features)
    )
}

/// Long options the save binary prints in their short form.
const SAVE_ALIASES: [(&str, &str); 10] = [
    ("--jump", "-j"),
    ("--goto", "-g"),
    ("--protocol", "-p"),
    ("--source", "-s"),
    ("--destination", "-d"),
    ("--in-interface", "-i"),
    ("--out-interface", "-o"),
    ("--match", "-m"),
    ("--source-ports", "--sports"),
    ("--destination-ports", "--dports"),
];

/// Splits a rule line into arguments, a double quoted span is one argument without its quotes.
fn split_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_arg = false;
    for c in text.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                in_arg = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

/// Rule text reduced to the form the save binary prints it in.
///
/// Options are shortened, quotes dropped, the implicit protocol match module removed and bare
/// host addresses given their prefix length. Anything else must match verbatim.
pub fn canonical(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut protocol: Option<String> = None;
    let mut args = split_args(text).into_iter().peekable();
    while let Some(arg) = args.next() {
        let arg = SAVE_ALIASES
            .iter()
            .find(|(long, _)| *long == arg)
            .map(|(_, short)| short.to_string())
            .unwrap_or(arg);
        match arg.as_str() {
            "-p" => {
                protocol = args.peek().cloned();
                out.push(arg);
            }
            "-m" if args.peek().is_some() && args.peek() == protocol.as_ref() => {
                args.next();
            }
            "-s" | "-d" => {
                out.push(arg);
                if let Some(addr) = args.next() {
                    if addr.contains('/') {
                        out.push(addr);
                    } else if addr.contains(':') {
                        out.push(format!("{addr}/128"));
                    } else {
                        out.push(format!("{addr}/32"));
                    }
                }
            }
            _ => out.push(arg),
        }
    }
    out
}

/// Whether a rule line read back from the dataplane is the rule we rendered.
pub fn same_rule(have: &str, want: &str) -> bool {
    canonical(have) == canonical(want)
}
