use pipesync_core::types::PipelineConfig;

/// Qualify a publish tag for the default registry.
///
/// A tag without a path segment is placed under the lowercased project
/// display name; a tag without a version gets a `${var}` placeholder the
/// engine resolves at execution time.
pub fn normalize_tag(tag: &str, project_display_name: &str, tag_var: &str) -> String {
    let mut tag = tag.to_string();
    if !tag.contains('/') {
        tag = format!("{}/{}", project_display_name.to_lowercase(), tag);
    }
    if !tag.contains(':') {
        tag = format!("{}:${{{}}}", tag, tag_var);
    }
    tag
}

/// Copy of `config` with every publish step that targets `default_registry`
/// normalized. Steps pushing elsewhere are left alone.
pub fn normalized_config(
    config: &PipelineConfig,
    default_registry: &str,
    project_display_name: &str,
    tag_var: &str,
) -> PipelineConfig {
    let mut out = config.clone();
    for step in out.stages.iter_mut().flat_map(|s| s.steps.iter_mut()) {
        if let Some(publish) = step.publish_image.as_mut() {
            if publish.registry == default_registry {
                publish.tag = normalize_tag(&publish.tag, project_display_name, tag_var);
            }
        }
    }
    out
}
