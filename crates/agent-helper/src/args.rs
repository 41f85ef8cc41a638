use anyhow::{Context, Result, bail};

#[derive(Debug)]
pub struct HelperArgs {
    pub capture_pipe: String,
    pub input_pipe: String,
}

impl HelperArgs {
    pub fn parse<I>(mut args: I) -> Result<Self>
    where
        I: Iterator<Item = String>,
    {
        let usage = "usage: agent-helper <capture-pipe> <input-pipe>";
        let capture_pipe = args.next().context(usage)?;
        let input_pipe = args.next().context(usage)?;

        if let Some(extra) = args.next() {
            bail!("too many arguments: {extra} ({usage})");
        }

        Ok(Self { capture_pipe, input_pipe })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_two_pipe_names() {
        let args =
            HelperArgs::parse(vec!["capture-abc".to_string(), "input-abc".to_string()].into_iter()).unwrap();
        assert_eq!(args.capture_pipe, "capture-abc");
        assert_eq!(args.input_pipe, "input-abc");
    }

    #[test]
    fn missing_input_pipe_is_an_error() {
        assert!(HelperArgs::parse(vec!["capture-abc".to_string()].into_iter()).is_err());
    }

    #[test]
    fn extra_arguments_are_an_error() {
        let raw = vec!["capture-abc".to_string(), "input-abc".to_string(), "extra".to_string()];
        assert!(HelperArgs::parse(raw.into_iter()).is_err());
    }
}
