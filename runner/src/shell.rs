use itertools::Itertools;
use std::borrow::Cow;

#[cfg(test)]
#[path = "shell_test.rs"]
mod shell_test;

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c)
}

/// Quote a single word for a POSIX shell
/// Words made only of safe characters are passed through untouched
pub fn quote(word: &str) -> Cow<'_, str> {
    if !word.is_empty() && word.chars().all(is_safe) {
        Cow::Borrowed(word)
    } else {
        // close the quote, emit an escaped quote, reopen
        Cow::Owned(format!("'{}'", word.replace('\'', r"'\''")))
    }
}

/// Render an argument vector as one shell line
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|word| quote(word.as_ref()).into_owned())
        .join(" ")
}
