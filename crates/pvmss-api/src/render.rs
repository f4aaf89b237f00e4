use handlebars::Handlebars;

use crate::error::{ApiError, ApiResult};

/// Embedded page templates; `header`/`footer` are shared partials.
const TEMPLATES: &[(&str, &str)] = &[
    ("header", include_str!("../templates/header.hbs")),
    ("footer", include_str!("../templates/footer.hbs")),
    ("landing", include_str!("../templates/landing.hbs")),
    ("login", include_str!("../templates/login.hbs")),
    ("admin_login", include_str!("../templates/admin_login.hbs")),
    ("logout", include_str!("../templates/logout.hbs")),
    ("search", include_str!("../templates/search.hbs")),
    ("profile", include_str!("../templates/profile.hbs")),
    ("vm_create", include_str!("../templates/vm_create.hbs")),
    ("vm_details", include_str!("../templates/vm_details.hbs")),
    ("admin", include_str!("../templates/admin.hbs")),
    ("admin_nodes", include_str!("../templates/admin_nodes.hbs")),
    ("admin_catalogue", include_str!("../templates/admin_catalogue.hbs")),
    ("admin_limits", include_str!("../templates/admin_limits.hbs")),
    ("error", include_str!("../templates/error.hbs")),
];

/// Thin render glue over a handlebars registry. Templates are compiled
/// once at startup; a template error afterwards is a bug, reported as an
/// internal error rather than a panic.
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        for (name, source) in TEMPLATES {
            registry
                .register_template_string(name, source)
                .unwrap_or_else(|e| panic!("template {} failed to compile: {}", name, e));
        }
        Self { registry }
    }

    pub fn page(&self, name: &str, context: &serde_json::Value) -> ApiResult<String> {
        self.registry
            .render(name, context)
            .map_err(|e| ApiError::Internal(format!("rendering {}: {}", name, e)))
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}
