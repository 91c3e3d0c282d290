//! Built-in default rule set, embedded in the binary.
//!
//! A small, realistic starting policy so the fast-path index and load
//! order in `loader.rs` have real content to exercise even before a user
//! writes their own `rules.yaml`. Authoring/distributing a larger bundled
//! rule pack is out of core scope; this is just enough to be useful.

pub const DEFAULT_RULES_YAML: &str = r#"
rules:
  - name: block-commit-protected-branch
    commands: ["git"]
    conditions:
      - command_matches: "^git\\s+commit"
      - git_branch_in: ["main", "master", "develop"]
    action: deny
    message: "Cannot commit directly to a protected branch. Create a feature branch first."

  - name: approve-force-push-protected-branch
    commands: ["git"]
    conditions:
      - command_matches: "^git\\s+push.*(--force|-f|--force-with-lease)"
      - git_branch_in: ["main", "master", "develop"]
    action: require_approval
    message: "Force push to a protected branch requires approval. This is a destructive operation."

  - name: deny-rm-rf-root
    commands: ["rm"]
    conditions:
      - command_matches: "rm\\s+(-\\w*r\\w*f\\w*|-\\w*f\\w*r\\w*)\\s+/($|\\s)"
    action: deny
    message: "Refusing to recursively force-remove the filesystem root."
"#;
