//! Automation masking for freshly opened tabs.
//!
//! Chat front-ends refuse or degrade service when they detect a driven
//! browser. Every tab gets an init script that runs before the page's own
//! scripts, plus locale and timezone overrides matching the session options.

use anyhow::Result;
use headless_chrome::protocol::cdp::Emulation::{SetLocaleOverride, SetTimezoneOverride};
use headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument;
use headless_chrome::Tab;

use crate::session::SessionOptions;

/// Init script for `locale` (e.g. "en-US"): hides `navigator.webdriver`,
/// reports languages consistent with the locale and fills in the
/// `window.chrome` object headless builds lack.
pub fn init_script(locale: &str) -> String {
    let mut languages = vec![format!("'{locale}'")];
    if let Some((primary, _)) = locale.split_once('-') {
        languages.push(format!("'{primary}'"));
    }
    let languages = languages.join(", ");

    format!(
        r#"(() => {{
    const define = (target, key, value) =>
        Object.defineProperty(target, key, {{ get: () => value, configurable: true }});
    define(navigator, 'webdriver', undefined);
    define(navigator, 'languages', [{languages}]);
    if (!window.chrome) {{
        window.chrome = {{ runtime: {{}}, app: {{ isInstalled: false }} }};
    }}
    const query = navigator.permissions && navigator.permissions.query;
    if (query) {{
        navigator.permissions.query = (p) => p && p.name === 'notifications'
            ? Promise.resolve({{ state: Notification.permission }})
            : query.call(navigator.permissions, p);
    }}
}})();"#
    )
}

/// Install the init script and the locale/timezone overrides on `tab`.
pub fn prepare_tab(tab: &Tab, options: &SessionOptions) -> Result<()> {
    tab.enable_debugger()?;
    tab.call_method(AddScriptToEvaluateOnNewDocument {
        source: init_script(&options.locale),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })?;

    tab.call_method(SetLocaleOverride {
        locale: Some(options.locale.clone()),
    })?;

    if let Some(timezone) = &options.timezone {
        tab.call_method(SetTimezoneOverride {
            timezone_id: timezone.clone(),
        })?;
    }

    Ok(())
}
