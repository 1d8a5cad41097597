use std::ops::Range;

/// A kernel compiler diagnostic (error, warning, or note).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    /// Byte range into the kernel source, when the compiler reported one.
    pub span: Option<Range<usize>>,
    pub notes: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Note,
}

impl Diagnostic {
    pub fn error(message: String, span: Option<Range<usize>>) -> Self {
        Self {
            severity: Severity::Error,
            message,
            span,
            notes: Vec::new(),
        }
    }

    pub fn warning(message: String, span: Option<Range<usize>>) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            span,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    /// Convert a message from the shader front end.
    pub fn from_compilation(message: &wgpu::CompilationMessage) -> Self {
        let severity = match message.message_type {
            wgpu::CompilationMessageType::Error => Severity::Error,
            wgpu::CompilationMessageType::Warning => Severity::Warning,
            wgpu::CompilationMessageType::Info => Severity::Note,
        };
        let span = message.location.map(|loc| {
            let start = loc.offset as usize;
            start..start + (loc.length as usize).max(1)
        });
        Self {
            severity,
            message: message.message.clone(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render the diagnostic with a source excerpt, without terminal colors,
    /// so the text can travel inside an error value and into log files.
    pub fn render(&self, filename: &str, source: &str) -> String {
        use ariadne::{Config, Label, Report, ReportKind, Source};

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
            Severity::Note => ReportKind::Advice,
        };

        // Clamp to the source so a stale location cannot make ariadne panic.
        let span = self.span.clone().map(|s| {
            let end = s.end.min(source.len());
            s.start.min(end)..end
        });

        let mut report = Report::build(kind, filename, span.as_ref().map_or(0, |s| s.start))
            .with_config(Config::default().with_color(false))
            .with_message(&self.message);

        if let Some(span) = span {
            report = report.with_label(Label::new((filename, span)).with_message(&self.message));
        }

        for note in &self.notes {
            report = report.with_note(note);
        }

        let mut out = Vec::new();
        if report
            .finish()
            .write((filename, Source::from(source)), &mut out)
            .is_err()
        {
            return format!("{}: {}", filename, self.message);
        }
        String::from_utf8_lossy(&out).into_owned()
    }
}

/// Render a list of diagnostics into one build log.
pub fn render_diagnostics(diagnostics: &[Diagnostic], filename: &str, source: &str) -> String {
    diagnostics
        .iter()
        .map(|d| d.render(filename, source))
        .collect::<Vec<_>>()
        .join("\n")
}
