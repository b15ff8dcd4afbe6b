//! Test runner implementation
//!
//! Executes test scenarios against an in-process session over the
//! scripted front end, asserting on structured responses where the
//! session offers them rather than on REPL text.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use colored::Colorize;
use serde::Deserialize;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::frontend::scripted::{End, ScriptHandle, ScriptedFrontEnd, Transcript};
use crate::frontend::Request;
use crate::runtime::sim::{SimProgram, SimRuntime};
use crate::session::event::FrameSummary;

use super::config::{
    CommandExpectation, EvaluateExpectation, FrameAssertion, StopExpectation, TestScenario,
    TestStep, VariableAssertion,
};

/// Result of a test run
#[derive(Debug)]
pub struct TestResult {
    pub name: String,
    pub passed: bool,
    pub steps_run: usize,
    pub steps_total: usize,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VariableInfo {
    name: String,
    value: String,
    #[serde(rename = "type")]
    type_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EvaluateResult {
    result: String,
    #[serde(rename = "type")]
    type_name: Option<String>,
}

/// Load a scenario from a YAML file
pub fn load_scenario(path: &Path) -> Result<TestScenario> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read test scenario '{}': {}",
            path.display(),
            e
        ))
    })?;

    serde_yaml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse test scenario: {}", e)))
}

/// Run a test scenario from a YAML file
pub fn run_scenario(path: &Path, verbose: bool) -> Result<TestResult> {
    let scenario = load_scenario(path)?;
    let steps_total = scenario.steps.len();

    println!(
        "\n{} {}",
        "Running Test:".blue().bold(),
        scenario.name.white().bold()
    );
    if let Some(desc) = &scenario.description {
        println!("  {}", desc.dimmed());
    }

    // Resolve program path relative to the scenario file
    let scenario_dir = path.parent().unwrap_or(Path::new("."));
    let program_path = if scenario.program.is_relative() {
        scenario_dir.join(&scenario.program)
    } else {
        scenario.program.clone()
    };
    let program = SimProgram::load(&program_path)?;

    println!("\n{}", "Starting debug session...".cyan());
    if verbose {
        println!(
            "  Program: {}",
            program_path.display().to_string().dimmed()
        );
    }

    let timeout = Duration::from_secs(scenario.timeout.unwrap_or(10));
    let (frontend, handle) = ScriptedFrontEnd::new();
    let runtime = SimRuntime::new(program);
    let settings = scenario.session.clone();
    let session = std::thread::Builder::new()
        .name("rdbg-scenario".to_string())
        .spawn(move || runtime.debug(Box::new(frontend), settings))?;

    let first = handle.wait(timeout)?;
    let mut runner = Runner::new(handle, first, timeout, verbose);
    println!("  {} Session started", "✓".green());

    println!("\n{}", "Steps:".cyan());
    for (i, step) in scenario.steps.iter().enumerate() {
        let step_num = i + 1;
        if let Err(e) = runner.execute(step, step_num) {
            println!("  {} Step {}: {}", "✗".red(), step_num, e);
            runner.shutdown(session);

            return Ok(TestResult {
                name: scenario.name,
                passed: false,
                steps_run: step_num,
                steps_total,
                error: Some(e.to_string()),
            });
        }
    }
    runner.shutdown(session);

    println!(
        "\n{} {}\n",
        "✓".green().bold(),
        "Test Passed".green().bold()
    );

    Ok(TestResult {
        name: scenario.name,
        passed: true,
        steps_run: steps_total,
        steps_total,
        error: None,
    })
}

/// Drives one scenario's session
struct Runner {
    handle: ScriptHandle,
    /// What the session did in response to the last step
    last: Transcript,
    /// Everything printed so far
    output: Vec<String>,
    /// Thread of the most recent stop
    thread: Option<usize>,
    timeout: Duration,
    verbose: bool,
}

impl Runner {
    fn new(handle: ScriptHandle, first: Transcript, timeout: Duration, verbose: bool) -> Self {
        let mut runner = Self {
            handle,
            last: first.clone(),
            output: Vec::new(),
            thread: None,
            timeout,
            verbose,
        };
        runner.observe(first);
        runner
    }

    fn observe(&mut self, transcript: Transcript) {
        if self.verbose {
            for line in &transcript.output {
                println!("    {}", line.dimmed());
            }
        }
        if let Some((thread, _)) = transcript.stopped() {
            self.thread = Some(thread);
        }
        self.output.extend(transcript.output.iter().cloned());
        self.last = transcript;
    }

    fn execute(&mut self, step: &TestStep, step_num: usize) -> Result<()> {
        match step {
            TestStep::Command {
                command,
                answer,
                expect,
            } => self.command(command, answer.as_deref(), expect.as_ref(), step_num),
            TestStep::Await { expect } => self.await_stop(expect.as_ref(), step_num),
            TestStep::InspectLocals { asserts } => self.inspect_locals(asserts, step_num),
            TestStep::InspectStack { asserts } => self.inspect_stack(asserts, step_num),
            TestStep::CheckOutput {
                contains,
                not_contains,
            } => self.check_output(contains.as_deref(), not_contains.as_deref(), step_num),
            TestStep::Evaluate { expression, expect } => {
                self.evaluate(expression, expect.as_ref(), step_num)
            }
            TestStep::Finish { exit_code } => self.finish(*exit_code, step_num),
        }
    }

    fn ensure_prompting(&self) -> Result<()> {
        match &self.last.end {
            End::Prompt => Ok(()),
            End::Ask(prompt) => Err(Error::TestAssertion(format!(
                "session is asking '{}', add an answer to the previous command",
                prompt.trim()
            ))),
            End::Quit(code) => Err(Error::TestAssertion(format!(
                "session already ended with status {}",
                code
            ))),
            End::Gone => Err(Error::TestAssertion("session already ended".to_string())),
        }
    }

    fn command(
        &mut self,
        command: &str,
        answer: Option<&str>,
        expect: Option<&CommandExpectation>,
        step_num: usize,
    ) -> Result<()> {
        self.ensure_prompting()?;
        let mut transcript = self.handle.command(command, self.timeout)?;
        if let (End::Ask(_), Some(answer)) = (&transcript.end, answer) {
            let mut reply = self.handle.command(answer, self.timeout)?;
            transcript.output.append(&mut reply.output);
            transcript.events.append(&mut reply.events);
            transcript.end = reply.end;
        }

        if let Some(exp) = expect {
            if let Some(expected) = &exp.output_contains {
                if !transcript.contains(expected) {
                    return Err(Error::TestAssertion(format!(
                        "Command '{}': output does not contain '{}'. Got: {:?}",
                        command, expected, transcript.output
                    )));
                }
            }
            if let Some(unexpected) = &exp.output_not_contains {
                if transcript.contains(unexpected) {
                    return Err(Error::TestAssertion(format!(
                        "Command '{}': output unexpectedly contains '{}'",
                        command, unexpected
                    )));
                }
            }
        }

        self.observe(transcript);
        println!("  {} Step {}: {}", "✓".green(), step_num, command.dimmed());
        Ok(())
    }

    /// Send a structured request at the prompt
    fn request(&mut self, request: Request) -> Result<std::result::Result<Value, String>> {
        self.ensure_prompting()?;
        let (result, transcript) = self.handle.request(request, self.timeout)?;
        self.observe(transcript);
        Ok(result)
    }

    fn frames(&mut self) -> Result<Vec<FrameSummary>> {
        let thread = self
            .thread
            .ok_or_else(|| Error::TestAssertion("no thread has stopped yet".to_string()))?;
        let body = self
            .request(Request::StackTrace { thread })?
            .map_err(Error::TestAssertion)?;
        serde_json::from_value(body["frames"].clone())
            .map_err(|e| Error::TestAssertion(format!("Failed to parse stack frames: {}", e)))
    }

    fn await_stop(&mut self, expect: Option<&StopExpectation>, step_num: usize) -> Result<()> {
        let (_, reason) = self
            .last
            .stopped()
            .ok_or_else(|| Error::TestAssertion("previous step did not stop".to_string()))?;
        let reason = reason.to_string();

        if let Some(expected) = expect.and_then(|e| e.reason.as_ref()) {
            if !reason.contains(expected.as_str()) {
                return Err(Error::TestAssertion(format!(
                    "Expected stop reason '{}', got '{}'",
                    expected, reason
                )));
            }
        }

        let frames = self.frames()?;
        let top = frames
            .first()
            .ok_or_else(|| Error::TestAssertion("stopped thread has no frames".to_string()))?;
        if let Some(exp) = expect {
            if let Some(expected_file) = &exp.file {
                if !top.path.contains(expected_file.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Expected file '{}', got '{}'",
                        expected_file, top.path
                    )));
                }
            }
            if let Some(expected_line) = exp.line {
                if expected_line != top.line {
                    return Err(Error::TestAssertion(format!(
                        "Expected line {}, got {}",
                        expected_line, top.line
                    )));
                }
            }
        }

        println!(
            "  {} Step {}: await ({} at {})",
            "✓".green(),
            step_num,
            reason.dimmed(),
            top.location().dimmed()
        );
        Ok(())
    }

    fn inspect_locals(&mut self, asserts: &[VariableAssertion], step_num: usize) -> Result<()> {
        let thread = self
            .thread
            .ok_or_else(|| Error::TestAssertion("no thread has stopped yet".to_string()))?;
        let body = self
            .request(Request::Locals {
                thread,
                frame: None,
            })?
            .map_err(Error::TestAssertion)?;
        let vars: Vec<VariableInfo> = serde_json::from_value(body["variables"].clone())
            .map_err(|e| Error::TestAssertion(format!("Failed to parse variables: {}", e)))?;

        for assertion in asserts {
            let Some(v) = vars.iter().find(|v| v.name == assertion.name) else {
                let available: Vec<&str> = vars.iter().map(|v| v.name.as_str()).collect();
                return Err(Error::TestAssertion(format!(
                    "Variable '{}' not found. Available: {:?}",
                    assertion.name, available
                )));
            };

            if let Some(expected_value) = &assertion.value {
                if &v.value != expected_value {
                    return Err(Error::TestAssertion(format!(
                        "Variable '{}': expected value '{}', got '{}'",
                        assertion.name, expected_value, v.value
                    )));
                }
            }
            if let Some(expected_substr) = &assertion.value_contains {
                if !v.value.contains(expected_substr.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Variable '{}': expected value containing '{}', got '{}'",
                        assertion.name, expected_substr, v.value
                    )));
                }
            }
            if let Some(expected_type) = &assertion.type_name {
                let actual_type = v.type_name.as_deref().unwrap_or("");
                if actual_type != expected_type {
                    return Err(Error::TestAssertion(format!(
                        "Variable '{}': expected type '{}', got '{}'",
                        assertion.name, expected_type, actual_type
                    )));
                }
            }
        }

        let checked: Vec<&str> = asserts.iter().map(|a| a.name.as_str()).collect();
        println!(
            "  {} Step {}: inspect locals ({:?})",
            "✓".green(),
            step_num,
            checked
        );
        Ok(())
    }

    fn inspect_stack(&mut self, asserts: &[FrameAssertion], step_num: usize) -> Result<()> {
        let frames = self.frames()?;

        for assertion in asserts {
            let frame = frames.get(assertion.index).ok_or_else(|| {
                Error::TestAssertion(format!(
                    "Frame {} does not exist (only {} frames)",
                    assertion.index,
                    frames.len()
                ))
            })?;

            if let Some(expected_func) = &assertion.function {
                if !frame.name.contains(expected_func.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Frame {}: expected function '{}', got '{}'",
                        assertion.index, expected_func, frame.name
                    )));
                }
            }
            if let Some(expected_file) = &assertion.file {
                if !frame.path.contains(expected_file.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Frame {}: expected file '{}', got '{}'",
                        assertion.index, expected_file, frame.path
                    )));
                }
            }
            if let Some(expected_line) = assertion.line {
                if expected_line != frame.line {
                    return Err(Error::TestAssertion(format!(
                        "Frame {}: expected line {}, got {}",
                        assertion.index, expected_line, frame.line
                    )));
                }
            }
        }

        println!(
            "  {} Step {}: inspect stack ({} frames checked)",
            "✓".green(),
            step_num,
            asserts.len()
        );
        Ok(())
    }

    fn check_output(
        &mut self,
        contains: Option<&str>,
        not_contains: Option<&str>,
        step_num: usize,
    ) -> Result<()> {
        let output = self.output.join("\n");

        if let Some(expected) = contains {
            if !output.contains(expected) {
                let skip = output.chars().count().saturating_sub(200);
                let tail: String = output.chars().skip(skip).collect();
                return Err(Error::TestAssertion(format!(
                    "Output does not contain '{}'. Last output: '{}'",
                    expected, tail
                )));
            }
        }
        if let Some(unexpected) = not_contains {
            if output.contains(unexpected) {
                return Err(Error::TestAssertion(format!(
                    "Output unexpectedly contains '{}'",
                    unexpected
                )));
            }
        }

        println!("  {} Step {}: check output", "✓".green(), step_num);
        Ok(())
    }

    fn evaluate(
        &mut self,
        expression: &str,
        expect: Option<&EvaluateExpectation>,
        step_num: usize,
    ) -> Result<()> {
        let result = self.request(Request::Evaluate {
            thread: self.thread,
            expr: expression.to_string(),
        })?;
        let expect_success = expect.and_then(|e| e.success).unwrap_or(true);

        let body = match (result, expect_success) {
            (Err(message), false) => {
                if let Some(expected) = expect.and_then(|e| e.result_contains.as_ref()) {
                    if !message.contains(expected.as_str()) {
                        return Err(Error::TestAssertion(format!(
                            "Evaluate '{}': expected error containing '{}', got '{}'",
                            expression, expected, message
                        )));
                    }
                }
                println!(
                    "  {} Step {}: evaluate '{}' (expected failure)",
                    "✓".green(),
                    step_num,
                    expression.dimmed()
                );
                return Ok(());
            }
            (Ok(body), false) => {
                return Err(Error::TestAssertion(format!(
                    "Evaluate '{}': expected failure but got result '{}'",
                    expression, body["result"]
                )))
            }
            (Err(message), true) => {
                return Err(Error::TestAssertion(format!(
                    "Evaluate '{}' failed: {}",
                    expression, message
                )))
            }
            (Ok(body), true) => body,
        };

        let eval_result: EvaluateResult = serde_json::from_value(body)
            .map_err(|e| Error::TestAssertion(format!("Failed to parse evaluate result: {}", e)))?;

        if let Some(exp) = expect {
            if let Some(expected_result) = &exp.result {
                if &eval_result.result != expected_result {
                    return Err(Error::TestAssertion(format!(
                        "Evaluate '{}': expected '{}', got '{}'",
                        expression, expected_result, eval_result.result
                    )));
                }
            }
            if let Some(expected_substr) = &exp.result_contains {
                if !eval_result.result.contains(expected_substr.as_str()) {
                    return Err(Error::TestAssertion(format!(
                        "Evaluate '{}': expected result containing '{}', got '{}'",
                        expression, expected_substr, eval_result.result
                    )));
                }
            }
            if let Some(expected_type) = &exp.type_name {
                let actual_type = eval_result.type_name.as_deref().unwrap_or("");
                if actual_type != expected_type {
                    return Err(Error::TestAssertion(format!(
                        "Evaluate '{}': expected type '{}', got '{}'",
                        expression, expected_type, actual_type
                    )));
                }
            }
        }

        println!(
            "  {} Step {}: evaluate '{}' = {}",
            "✓".green(),
            step_num,
            expression.dimmed(),
            eval_result.result.dimmed()
        );
        Ok(())
    }

    fn finish(&mut self, exit_code: Option<i32>, step_num: usize) -> Result<()> {
        // The session quits on its own once the program ends
        let code = loop {
            match &self.last.end {
                End::Prompt => {
                    let transcript = self.handle.command("continue", self.timeout)?;
                    self.observe(transcript);
                }
                End::Quit(code) => break *code,
                End::Gone => break 0,
                End::Ask(prompt) => {
                    return Err(Error::TestAssertion(format!(
                        "session is asking '{}'",
                        prompt.trim()
                    )))
                }
            }
        };
        if let Some(expected) = exit_code {
            if expected != code {
                return Err(Error::TestAssertion(format!(
                    "Expected exit status {}, got {}",
                    expected, code
                )));
            }
        }

        println!(
            "  {} Step {}: finish (exit status {})",
            "✓".green(),
            step_num,
            code
        );
        Ok(())
    }

    /// End the session if it is still waiting and collect its thread
    fn shutdown(mut self, session: JoinHandle<Result<i32>>) {
        if matches!(self.last.end, End::Prompt | End::Ask(_)) {
            let _ = self.handle.command("kill!", self.timeout);
        }
        self.handle.close();
        match session.join() {
            Ok(Ok(code)) => tracing::debug!(code, "scenario session ended"),
            Ok(Err(e)) => tracing::warn!(error = %e, "scenario session failed"),
            Err(_) => tracing::error!("scenario session panicked"),
        }
    }
}

/// Run several scenarios and print a summary
pub fn run_all(paths: &[impl AsRef<Path>], verbose: bool) -> Result<Vec<TestResult>> {
    let mut results = Vec::new();
    for path in paths {
        results.push(run_scenario(path.as_ref(), verbose)?);
    }

    if results.len() > 1 {
        let passed = results.iter().filter(|r| r.passed).count();
        let summary = format!("{}/{} scenarios passed", passed, results.len());
        if passed == results.len() {
            println!("{}", summary.green().bold());
        } else {
            println!("{}", summary.red().bold());
        }
    }
    Ok(results)
}
