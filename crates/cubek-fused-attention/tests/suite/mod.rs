pub(crate) mod launcher;
