use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::registry::GlobalMessageRegistry;
use crate::title::{message_key_for_title, split_subpage};
use crate::updater::{FinaliseReport, PageSource, Revision};

/// Namespace id of interface messages local to each wiki.
pub const NS_MEDIAWIKI: i32 = 8;

/// Error key shown when a protected global message is edited.
pub const PROTECTED_ERROR_KEY: &str = "globalmsg-protected";

/// Warning shown above the edit box of a global message page.
pub const EDIT_NOTICE_KEY: &str = "globalmsg-onmsgedit";

/// A page as reported by a host event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub page_id: i64,
    pub namespace: i32,
    /// Title text without the namespace prefix.
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditRestriction {
    pub error_key: &'static str,
    pub message: String,
    pub reason: String,
}

/// Reacts to page lifecycle events of the host. Only pages in the
/// global-message namespace of the central wiki touch the store.
pub struct PageEventHandler<'a> {
    registry: &'a GlobalMessageRegistry,
    pages: &'a dyn PageSource,
}

impl<'a> PageEventHandler<'a> {
    pub fn new(registry: &'a GlobalMessageRegistry, pages: &'a dyn PageSource) -> Self {
        Self { registry, pages }
    }

    pub fn can_act_on(&self, namespace: i32) -> bool {
        let settings = self.registry.settings();
        settings.is_central_wiki() && namespace == settings.namespace
    }

    pub fn on_page_save_complete(
        &self,
        page: &PageRef,
        revision: &Revision,
    ) -> Result<Option<FinaliseReport>> {
        if !self.can_act_on(page.namespace) {
            return Ok(None);
        }
        let mut updater = self.registry.create_updater(self.pages);
        updater.insert(page.page_id, Some(revision))?;
        updater.finalise().map(Some)
    }

    pub fn on_page_delete_complete(
        &self,
        page: &PageRef,
        page_id: i64,
    ) -> Result<Option<FinaliseReport>> {
        if !self.can_act_on(page.namespace) {
            return Ok(None);
        }
        let mut updater = self.registry.create_updater(self.pages);
        updater.delete(page_id);
        updater.finalise().map(Some)
    }

    pub fn on_page_undelete(&self, page: &PageRef) -> Result<Option<FinaliseReport>> {
        if !self.can_act_on(page.namespace) {
            return Ok(None);
        }
        let mut updater = self.registry.create_updater(self.pages);
        updater.insert(page.page_id, None)?;
        updater.finalise().map(Some)
    }

    /// A page moved into the namespace is stored under its new title; a page
    /// moved out of it is dropped.
    pub fn on_page_move_complete(
        &self,
        old: &PageRef,
        new: &PageRef,
        page_id: i64,
    ) -> Result<Option<FinaliseReport>> {
        let mut updater = self.registry.create_updater(self.pages);
        if self.can_act_on(new.namespace) {
            updater.insert(page_id, None)?;
        } else if self.can_act_on(old.namespace) {
            updater.delete(page_id);
        } else {
            return Ok(None);
        }
        updater.finalise().map(Some)
    }

    /// Override for the host message cache; `None` keeps the host's own text.
    pub fn on_messages_preload(&self, title: &str, code: &str) -> Result<Option<String>> {
        self.registry.resolve(title, code)
    }

    /// Text to prefill when creating a page. A global message page gets its
    /// current text (language from the subpage, else `*`); a local
    /// `MediaWiki:` override page gets the global text it would shadow.
    pub fn edit_form_preload_text(
        &self,
        page: &PageRef,
        content_language: &str,
    ) -> Result<Option<String>> {
        if page.namespace == self.registry.settings().namespace {
            let key = message_key_for_title(&page.title, self.registry.languages());
            return self.registry.resolve(&key.name, &key.language);
        }
        if page.namespace != NS_MEDIAWIKI {
            return Ok(None);
        }
        let (name, language) = match split_subpage(&page.title) {
            (base, Some(code)) if self.registry.languages().is_known(code) => (base, code),
            _ => (page.title.as_str(), content_language),
        };
        self.registry.resolve(name, language)
    }

    pub fn edit_notice(&self, page: &PageRef) -> Option<&'static str> {
        (page.namespace == self.registry.settings().namespace).then_some(EDIT_NOTICE_KEY)
    }

    /// Any action other than `read` on a listed global message is refused.
    pub fn permission_error(&self, page: &PageRef, action: &str) -> Result<Option<EditRestriction>> {
        if action == "read" || page.namespace != self.registry.settings().namespace {
            return Ok(None);
        }
        let (base, _) = split_subpage(&page.title);
        let Some(reason) = self.registry.get_edit_restriction_info(base)? else {
            return Ok(None);
        };
        debug!(title = %page.title, action, "refusing action on protected global message");
        let message = if reason.is_empty() {
            format!("{base} is a protected global message")
        } else {
            format!("{base} is a protected global message: {reason}")
        };
        Ok(Some(EditRestriction {
            error_key: PROTECTED_ERROR_KEY,
            message,
            reason,
        }))
    }
}
