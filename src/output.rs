use std::io::{self, Write};

use serde::Serialize;

use crate::workflow::{RunOutcome, RunPlan};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_plan(plan: &RunPlan) -> io::Result<()> {
        Self::print_json(plan)
    }

    pub fn print_outcome(outcome: &RunOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
