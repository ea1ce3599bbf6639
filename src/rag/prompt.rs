/// The assistant persona described to the completion model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    pub name: String,
    pub role: String,
    pub goal: String,
    pub tone: String,
    pub extra_instructions: Option<String>,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "RAG Genius".to_string(),
            role: "assistant".to_string(),
            goal: "answer questions in a helpful manner".to_string(),
            tone: "friendly".to_string(),
            extra_instructions: None,
        }
    }
}

impl Persona {
    pub fn with_extra_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.extra_instructions = Some(instructions.into());
        self
    }
}

/// System prompt grounding the model in the retrieved `chunks`.
pub fn build_system_prompt(persona: &Persona, chunks: &[&str], query: &str) -> String {
    let mut prompt = format!(
        "Your name is {}. You are an AI {}. Your goal is to {}. Your tone should be {}.",
        persona.name, persona.role, persona.goal, persona.tone
    );
    if let Some(extra) = &persona.extra_instructions {
        prompt.push_str(" Additional instructions: ");
        prompt.push_str(extra);
    }

    prompt.push_str(
        "\n\nYou have received the following relevant information to respond to the query:\n\n",
    );
    prompt.push_str(&chunks.join("\n"));
    prompt.push_str(
        "\n\nUse this information to provide a helpful response to the following query: ",
    );
    prompt.push_str(query);
    prompt
}
