mod test_sipaddr;
