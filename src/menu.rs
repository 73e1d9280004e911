//! Interactive operator session: numbered menu over line input.
//!
//! Generic over the input and output so tests can drive it with byte buffers.
//! End of input behaves like choosing Exit.

use std::io::{self, Write};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::info;
use uuid::Uuid;

use crate::config::{CommandLine, ToolDescriptor};
use crate::control::ControlPlane;
use crate::llm::ChatMessage;

const MENU: &str = "\
1. Chat with LLM
2. View configuration
3. Add tool
4. Remove tool
5. Pull model
6. Start/restart tools
7. Exit";

/// Run the session until Exit or end of input.
pub async fn run<R, W>(plane: &ControlPlane, input: R, out: W) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    Session {
        plane,
        lines: input.lines(),
        out,
    }
    .run()
    .await
}

struct Session<'a, R, W> {
    plane: &'a ControlPlane,
    lines: Lines<R>,
    out: W,
}

impl<R, W> Session<'_, R, W>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    async fn run(&mut self) -> io::Result<()> {
        loop {
            writeln!(self.out, "\n{MENU}")?;
            let Some(choice) = self.prompt("Select an option: ").await? else {
                break;
            };
            match choice.as_str() {
                "1" => self.chat().await?,
                "2" => self.view_config().await?,
                "3" => self.add_tool().await?,
                "4" => self.remove_tool().await?,
                "5" => self.pull_model().await?,
                "6" => self.start_tools().await?,
                "7" => break,
                _ => writeln!(self.out, "Invalid choice.")?,
            }
        }
        writeln!(self.out, "Goodbye.")?;
        Ok(())
    }

    /// Print `label` and read one trimmed line. `None` at end of input.
    async fn prompt(&mut self, label: &str) -> io::Result<Option<String>> {
        write!(self.out, "{label}")?;
        self.out.flush()?;
        Ok(self
            .lines
            .next_line()
            .await?
            .map(|line| line.trim().to_string()))
    }

    /// Read a 1-based choice into a list of `len` entries.
    async fn pick(&mut self, label: &str, len: usize) -> io::Result<Option<usize>> {
        let Some(answer) = self.prompt(label).await? else {
            return Ok(None);
        };
        match answer.parse::<usize>() {
            Ok(n) if (1..=len).contains(&n) => Ok(Some(n - 1)),
            Ok(_) => {
                writeln!(self.out, "Invalid choice.")?;
                Ok(None)
            }
            Err(_) => {
                writeln!(self.out, "Invalid input. Please enter a number.")?;
                Ok(None)
            }
        }
    }

    async fn chat(&mut self) -> io::Result<()> {
        let llm = self.plane.llm().clone();
        let mut model = self.plane.registry().document().default_model().to_string();
        llm.ensure_model(&model).await;

        let session = Uuid::new_v4();
        info!(%session, model = %model, "chat session started");
        writeln!(self.out, "Starting chat with {model}...")?;
        writeln!(self.out, "Type 'exit' to quit, 'change model' to switch models.")?;

        let mut history: Vec<ChatMessage> = Vec::new();
        loop {
            let Some(line) = self.prompt("\nYou: ").await? else {
                break;
            };
            match line.to_lowercase().as_str() {
                "" => continue,
                "exit" => {
                    writeln!(self.out, "Chat ended.")?;
                    break;
                }
                "change model" => {
                    let models = llm.list_models().await.unwrap_or_default();
                    if models.is_empty() {
                        writeln!(self.out, "No models available. Please pull a model first.")?;
                        continue;
                    }
                    for (i, name) in models.iter().enumerate() {
                        writeln!(self.out, "{}. {name}", i + 1)?;
                    }
                    if let Some(i) = self
                        .pick("Enter the number of the model to use: ", models.len())
                        .await?
                    {
                        model = models[i].clone();
                        writeln!(self.out, "Switched to model {model}.")?;
                        if let Err(e) = self.plane.set_default_model(&model) {
                            writeln!(self.out, "Could not save default model: {e}")?;
                        }
                    }
                    continue;
                }
                _ => {}
            }

            history.push(ChatMessage::user(line));
            match llm.chat(&model, &history).await {
                Ok(reply) => {
                    writeln!(self.out, "\nAssistant: {reply}")?;
                    history.push(ChatMessage::assistant(reply));
                }
                Err(e) => {
                    history.pop();
                    writeln!(self.out, "Error: {e}. Make sure Ollama is running locally.")?;
                }
            }
        }
        info!(%session, turns = history.len() / 2, "chat session ended");
        Ok(())
    }

    async fn view_config(&mut self) -> io::Result<()> {
        let doc = self.plane.registry().document();
        writeln!(self.out, "Name:          {}", doc.display_name())?;
        writeln!(self.out, "Description:   {}", doc.display_description())?;
        writeln!(self.out, "Default Model: {}", doc.default_model())?;
        writeln!(self.out, "LLM backend:   {}", self.plane.llm().base_url())?;

        let tools = self.plane.tool_views();
        if tools.is_empty() {
            writeln!(self.out, "No tools configured.")?;
            return Ok(());
        }
        let status = self.plane.registry().check_all_connections().await;
        writeln!(self.out, "\n{:<16} {:<24} {:<32} Status", "ID", "Name", "URL")?;
        for tool in &tools {
            let state = if !tool.is_active() {
                "Inactive"
            } else if status.get(&tool.id).copied().unwrap_or(false) {
                "Running"
            } else {
                "Stopped"
            };
            writeln!(
                self.out,
                "{:<16} {:<24} {:<32} {state}",
                tool.id,
                tool.display_name(),
                tool.base_url().unwrap_or("N/A"),
            )?;
        }
        Ok(())
    }

    async fn add_tool(&mut self) -> io::Result<()> {
        writeln!(self.out, "Add new tool")?;
        let Some(id) = self.prompt("Tool ID: ").await? else {
            return Ok(());
        };
        let name = self.prompt("Tool Name: ").await?.unwrap_or_default();
        let url = self.prompt("Tool URL: ").await?.unwrap_or_default();
        let start = self.prompt("Start Command: ").await?.unwrap_or_default();
        let dir = self.prompt("Command Directory: ").await?.unwrap_or_default();
        let caps = self
            .prompt("Capabilities (comma-separated): ")
            .await?
            .unwrap_or_default();
        let install = self
            .prompt("Installation Command (optional): ")
            .await?
            .unwrap_or_default();
        let install_dir = if install.is_empty() {
            String::new()
        } else {
            self.prompt("Installation Directory (optional): ")
                .await?
                .unwrap_or_default()
        };

        let capabilities: Vec<String> = caps
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from)
            .collect();
        let tool = ToolDescriptor {
            name: non_empty(name),
            url: non_empty(url),
            capabilities: (!capabilities.is_empty()).then_some(capabilities),
            active: Some(true),
            start_command: non_empty(start).map(CommandLine::Line),
            command_directory: non_empty(dir.clone()).map(Into::into),
            installation_command: non_empty(install).map(CommandLine::Line),
            installation_directory: non_empty(install_dir)
                .or_else(|| non_empty(dir))
                .map(Into::into),
            ..ToolDescriptor::new(id)
        };
        let label = tool.display_name().to_string();
        match self.plane.add_tool(tool) {
            Ok(()) => writeln!(self.out, "Tool {label} added successfully."),
            Err(e) => writeln!(self.out, "Could not add tool: {e}"),
        }
    }

    async fn remove_tool(&mut self) -> io::Result<()> {
        let tools = self.plane.registry().descriptors();
        if tools.is_empty() {
            writeln!(self.out, "No tools configured.")?;
            return Ok(());
        }
        writeln!(self.out, "Remove tool")?;
        for (i, tool) in tools.iter().enumerate() {
            writeln!(self.out, "{}. {} ({})", i + 1, tool.display_name(), tool.id)?;
        }
        let Some(i) = self
            .pick("Enter the number of the tool to remove: ", tools.len())
            .await?
        else {
            return Ok(());
        };
        let tool = &tools[i];
        match self.plane.remove_tool(&tool.id) {
            Ok(()) => writeln!(self.out, "Tool {} removed successfully.", tool.display_name()),
            Err(e) => writeln!(self.out, "Could not remove tool: {e}"),
        }
    }

    async fn pull_model(&mut self) -> io::Result<()> {
        let name = self
            .prompt("Model Name (e.g., llama3, llama3:8b, gemma:2b): ")
            .await?
            .unwrap_or_default();
        if name.is_empty() {
            writeln!(self.out, "Model name cannot be empty.")?;
            return Ok(());
        }
        writeln!(self.out, "Pulling model {name}...")?;
        if let Err(e) = self.plane.llm().pull(&name).await {
            writeln!(self.out, "Error pulling model: {e}")?;
            return Ok(());
        }
        writeln!(self.out, "Model {name} pulled successfully.")?;
        if let Err(e) = self.plane.set_default_model(&name) {
            writeln!(self.out, "Could not save default model: {e}")?;
        }
        Ok(())
    }

    async fn start_tools(&mut self) -> io::Result<()> {
        let results = self.plane.ensure_all().await;
        if results.is_empty() {
            writeln!(self.out, "No active tools configured.")?;
        }
        for (tool, result) in results {
            match result {
                Ok(outcome) => writeln!(self.out, "{}: {outcome:?}", tool.display_name())?,
                Err(e) => writeln!(self.out, "{}: {e}", tool.display_name())?,
            }
        }
        Ok(())
    }
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}
